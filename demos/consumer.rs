//! Run two simulated devices and print consistent snapshots.
//!
//! A polled "head" tracker circles the origin while a channel-fed "wand"
//! reports a tracker, a trigger button and a valuator. The consumer waits for
//! complete update cycles and prints one line per cycle.
//!
//! A `[[device]]` section named "wand" in the optional configuration file
//! replaces the built-in wand layout, e.g. to attach a calibrator
//! (see demos/daemon.toml).
//!
//! Usage: cargo run --example consumer [-- demos/daemon.toml]

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Condvar;
use std::sync::Arc;
use std::time::Duration;
use vrdevice::{
    ChannelDevice, CycleWait, DaemonConfig, DeviceConfig, DeviceCore, DeviceManager, FeatureLayout, Health,
    PollDevice, RawReport, TrackerFlags, TrackerState,
};

const CYCLES: u64 = 50;

fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match DaemonConfig::load(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };

    let mut daemon = match DeviceManager::from_config(&config) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to set up devices: {}", e);
            std::process::exit(1);
        }
    };

    let mut angle = 0.0f64;
    let head_poller = move |core: &mut DeviceCore| -> vrdevice::Result<bool> {
        angle += 0.05;
        let state = TrackerState::from_pose(
            Vector3::new(angle.cos(), 1.7, angle.sin()),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -angle),
        );
        let now = core.timestamp_us();
        core.set_tracker_state(0, &state, now);
        Ok(true)
    };
    let mut head = PollDevice::new(
        "head",
        daemon.manager(),
        &FeatureLayout::new(1, 0, 0).with_tracker_names(["Head"]),
        Duration::from_millis(10),
        Box::new(head_poller),
    );
    if let Some(core) = head.core_mut() {
        core.set_flags(TrackerFlags::ESTIMATE_VELOCITY);
    }

    let mut wand_config = DeviceConfig::new("wand", 1, 1, 1);
    wand_config.tracker_names = vec!["Wand".into()];
    wand_config.button_names = vec!["Trigger".into()];
    wand_config.valuator_names = vec!["Joystick".into()];
    let wand_config = config.device("wand").cloned().unwrap_or(wand_config);

    let (wand, wand_tx) = match ChannelDevice::from_config(daemon.manager(), &wand_config, daemon.calibrators()) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to configure wand: {}", e);
            std::process::exit(1);
        }
    };

    daemon.add_device(Box::new(head));
    daemon.add_device(Box::new(wand));
    daemon.start();

    let producer = std::thread::spawn(move || {
        for frame in 0..CYCLES * 2 {
            let t = frame as f64 * 0.02;
            let reports = [
                RawReport::Tracker {
                    index: 0,
                    state: TrackerState::from_pose(Vector3::new(0.3, 1.2, -0.4 + 0.1 * t.sin()), UnitQuaternion::identity()),
                    timestamp_us: frame * 20_000,
                },
                RawReport::Button { index: 0, pressed: frame % 20 < 10 },
                RawReport::Valuator { index: 0, value: t.sin() },
                RawReport::EndOfCycle,
            ];
            for report in reports {
                if wand_tx.send(report).is_err() {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    });

    let manager = daemon.manager().clone();
    let cond = Arc::new(Condvar::new());
    manager.enable_tracker_update_notification(cond.clone());

    let head = manager.tracker_index("Head").unwrap_or(0);
    let wand = manager.tracker_index("Wand").unwrap_or(1);
    let trigger = manager.button_index("Trigger").unwrap_or(0);

    let mut seen = 0;
    while seen < CYCLES {
        let mut state = manager.lock_state();
        match state.wait_for_update(&cond, Some(manager.config().stall_timeout())) {
            CycleWait::Completed(cycle) => {
                seen += 1;
                let s = state.state();
                let h = s.tracker(head);
                let w = s.tracker(wand);
                println!(
                    "cycle {:4}  head ({:+.3}, {:+.3}, {:+.3}) |v|={:.2}  wand ({:+.3}, {:+.3}, {:+.3})  trigger={}  joystick={:+.2}",
                    cycle,
                    h.position.x,
                    h.position.y,
                    h.position.z,
                    h.linear_velocity.norm(),
                    w.position.x,
                    w.position.y,
                    w.position.z,
                    s.button(trigger),
                    s.valuator(0),
                );
            }
            CycleWait::TimedOut => {
                drop(state);
                if let Health::Stalled { since } = manager.health() {
                    eprintln!("No complete update cycle for {:?}", since);
                }
                for event in manager.events().try_iter() {
                    eprintln!("Device event: {:?}", event);
                }
                break;
            }
        }
    }

    manager.disable_tracker_update_notification();
    daemon.stop();
    let _ = producer.join();
}
