//! Grid-based tracker calibration.
//!
//! The tracking volume is sampled on a rectilinear grid. Each grid vertex
//! stores the correction measured when the tracker reported exactly that
//! vertex's nominal position: a position offset relative to the nominal
//! position and an orientation offset as a scaled rotation axis. Samples are
//! corrected by trilinear interpolation inside the cell containing the raw
//! position. Cells with any unmeasured corner are left uncorrected.
//!
//! Orientation offsets are interpolated linearly in their scaled-axis form.
//! That is only accurate while neighbouring vertices differ by small angles;
//! grids with large orientation changes between vertices will show error in
//! between.
//!
//! # File format
//!
//! Whitespace separated tokens, `#` starts a comment:
//!
//! ```text
//! nx ny nz                # vertex counts, each at least 2
//! ox oy oz                # position of vertex (0, 0, 0)
//! cx cy cz                # cell size
//! V tx ty tz ax ay az a   # one record per vertex, last axis fastest
//! I                       # vertex without measurement
//! ```
//!
//! The angle `a` is in radians. Validity flags `V`, `v`, `1` and `+` mark a
//! measured vertex; `I`, `i`, `0` and `-` an unmeasured one.

use super::Calibrator;
use crate::error::DeviceError;
use crate::types::TrackerState;
use crate::Result;
use nalgebra::{Isometry3, Unit, UnitQuaternion, Vector3};
use std::path::Path;

/// Correction measured at one grid vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionRecord {
    pub position_offset: Vector3<f64>,
    /// Rotation correction as axis scaled by angle in radians.
    pub orientation_offset: Vector3<f64>,
    pub valid: bool,
}

impl CorrectionRecord {
    pub fn new(position_offset: Vector3<f64>, orientation_offset: Vector3<f64>) -> Self {
        Self {
            position_offset,
            orientation_offset,
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            position_offset: Vector3::zeros(),
            orientation_offset: Vector3::zeros(),
            valid: false,
        }
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_scaled_axis(self.orientation_offset)
    }

    /// `self * (1 - t) + other * t`, exact at `t = 0` and `t = 1`.
    fn lerp(&self, other: &Self, t: f64) -> Self {
        let s = 1.0 - t;
        Self {
            position_offset: self.position_offset * s + other.position_offset * t,
            orientation_offset: self.orientation_offset * s + other.orientation_offset * t,
            valid: self.valid && other.valid,
        }
    }
}

/// Rectilinear grid of correction records.
#[derive(Debug, Clone)]
pub struct CalibrationGrid {
    size: [usize; 3],
    origin: Vector3<f64>,
    cell_size: Vector3<f64>,
    vertices: Vec<CorrectionRecord>,
    cell_valid: Vec<bool>,
}

impl CalibrationGrid {
    pub fn new(
        size: [usize; 3],
        origin: Vector3<f64>,
        cell_size: Vector3<f64>,
        vertices: Vec<CorrectionRecord>,
    ) -> Result<Self> {
        let expected = check_geometry(size, &cell_size)?;
        if vertices.len() != expected {
            return Err(DeviceError::Config(format!(
                "calibration grid of size {:?} needs {} vertices, got {}",
                size,
                expected,
                vertices.len()
            )));
        }

        let mut grid = Self {
            size,
            origin,
            cell_size,
            vertices,
            cell_valid: Vec::new(),
        };
        grid.cell_valid = grid.compute_cell_validity();
        Ok(grid)
    }

    /// Build a grid from ground-truth poses measured at each nominal vertex.
    ///
    /// `measured` is in vertex order; `None` marks a vertex without data.
    pub fn from_measurements(
        size: [usize; 3],
        origin: Vector3<f64>,
        cell_size: Vector3<f64>,
        measured: &[Option<Isometry3<f64>>],
    ) -> Result<Self> {
        check_geometry(size, &cell_size)?;
        let [_, ny, nz] = size;
        let vertices = measured
            .iter()
            .enumerate()
            .map(|(n, pose)| match pose {
                Some(pose) => {
                    let vertex = [n / (ny * nz), (n / nz) % ny, n % nz];
                    let nominal = vertex_position(origin, cell_size, vertex);
                    CorrectionRecord::new(
                        pose.translation.vector - nominal,
                        pose.rotation.scaled_axis(),
                    )
                }
                None => CorrectionRecord::invalid(),
            })
            .collect();
        Self::new(size, origin, cell_size, vertices)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let grid = Self::parse(&text)?;
        log::info!(
            "Loaded calibration grid {:?} from {} ({} of {} cells valid)",
            grid.size,
            path.display(),
            grid.num_valid_cells(),
            grid.cell_valid.len()
        );
        Ok(grid)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = Tokens::new(text);
        let size = [tokens.usize()?, tokens.usize()?, tokens.usize()?];
        let origin = tokens.vector()?;
        let cell_size = tokens.vector()?;

        if size.iter().any(|&n| n < 2) {
            return Err(DeviceError::calibration(
                tokens.line(),
                format!("grid size {:?} must be at least 2 on every axis", size),
            ));
        }

        // Every vertex record takes at least one token.
        let count = vertex_count(size)
            .filter(|&count| count <= tokens.remaining())
            .ok_or_else(|| {
                DeviceError::calibration(
                    tokens.line(),
                    format!(
                        "grid size {:?} needs more vertex records than the file holds ({} tokens left)",
                        size,
                        tokens.remaining()
                    ),
                )
            })?;
        let mut vertices = Vec::with_capacity(count);
        for _ in 0..count {
            vertices.push(tokens.record()?);
        }
        tokens.finish()?;

        Self::new(size, origin, cell_size, vertices)
            .map_err(|e| DeviceError::calibration(tokens.line(), e.to_string()))
    }

    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    pub fn origin(&self) -> Vector3<f64> {
        self.origin
    }

    pub fn cell_size(&self) -> Vector3<f64> {
        self.cell_size
    }

    fn vertex_offset(&self, [i, j, k]: [usize; 3]) -> usize {
        (i * self.size[1] + j) * self.size[2] + k
    }

    fn cell_offset(&self, [i, j, k]: [usize; 3]) -> usize {
        (i * (self.size[1] - 1) + j) * (self.size[2] - 1) + k
    }

    pub fn vertex(&self, index: [usize; 3]) -> &CorrectionRecord {
        &self.vertices[self.vertex_offset(index)]
    }

    /// Nominal position of a grid vertex.
    pub fn vertex_position(&self, index: [usize; 3]) -> Vector3<f64> {
        vertex_position(self.origin, self.cell_size, index)
    }

    pub fn is_cell_valid(&self, cell: [usize; 3]) -> bool {
        self.cell_valid[self.cell_offset(cell)]
    }

    pub fn num_valid_cells(&self) -> usize {
        self.cell_valid.iter().filter(|&&v| v).count()
    }

    fn compute_cell_validity(&self) -> Vec<bool> {
        let [nx, ny, nz] = self.size;
        let mut valid = Vec::with_capacity((nx - 1) * (ny - 1) * (nz - 1));
        for i in 0..nx - 1 {
            for j in 0..ny - 1 {
                for k in 0..nz - 1 {
                    valid.push(corners([i, j, k]).iter().all(|&c| self.vertex(c).valid));
                }
            }
        }
        valid
    }

    /// Cell containing `position` and the position inside that cell.
    ///
    /// Positions outside the grid are attributed to the nearest boundary
    /// cell; their cell-local coordinates then fall outside `[0, 1]`.
    pub fn locate(&self, position: &Vector3<f64>) -> ([usize; 3], Vector3<f64>) {
        let mut cell = [0usize; 3];
        let mut cell_pos = Vector3::zeros();
        for axis in 0..3 {
            let grid_pos = (position[axis] - self.origin[axis]) / self.cell_size[axis];
            let max_cell = (self.size[axis] - 2) as f64;
            let index = grid_pos.floor().clamp(0.0, max_cell);
            cell[axis] = index as usize;
            cell_pos[axis] = grid_pos - index;
        }
        (cell, cell_pos)
    }

    /// Interpolated correction at `position`, or `None` inside an invalid cell.
    pub fn interpolate(&self, position: &Vector3<f64>) -> Option<CorrectionRecord> {
        let (cell, cell_pos) = self.locate(position);
        if !self.is_cell_valid(cell) {
            return None;
        }
        Some(self.interpolate_cell(cell, &cell_pos))
    }

    /// Trilinear interpolation of the eight corners of `cell`.
    pub fn interpolate_cell(&self, cell: [usize; 3], cell_pos: &Vector3<f64>) -> CorrectionRecord {
        let [i, j, k] = cell;

        // Along axis 0: four cell edges, indexed by (dj, dk).
        let mut edges = [CorrectionRecord::invalid(); 4];
        for (n, edge) in edges.iter_mut().enumerate() {
            let (dj, dk) = (n >> 1, n & 1);
            let v0 = self.vertex([i, j + dj, k + dk]);
            let v1 = self.vertex([i + 1, j + dj, k + dk]);
            *edge = v0.lerp(v1, cell_pos[0]);
        }

        // Along axis 1: two faces, indexed by dk.
        let faces = [
            edges[0].lerp(&edges[2], cell_pos[1]),
            edges[1].lerp(&edges[3], cell_pos[1]),
        ];

        faces[0].lerp(&faces[1], cell_pos[2])
    }
}

fn vertex_count([nx, ny, nz]: [usize; 3]) -> Option<usize> {
    nx.checked_mul(ny)?.checked_mul(nz)
}

/// Validate grid dimensions and return the vertex count.
fn check_geometry(size: [usize; 3], cell_size: &Vector3<f64>) -> Result<usize> {
    if size.iter().any(|&n| n < 2) {
        return Err(DeviceError::Config(format!(
            "calibration grid must have at least 2 vertices per axis, got {:?}",
            size
        )));
    }
    if cell_size.iter().any(|&c| c <= 0.0 || !c.is_finite()) {
        return Err(DeviceError::Config(format!(
            "calibration grid cell size must be positive, got {:?}",
            cell_size.as_slice()
        )));
    }
    vertex_count(size).ok_or_else(|| {
        DeviceError::Config(format!("calibration grid of size {:?} is too large", size))
    })
}

fn vertex_position(origin: Vector3<f64>, cell_size: Vector3<f64>, [i, j, k]: [usize; 3]) -> Vector3<f64> {
    origin + Vector3::new(i as f64, j as f64, k as f64).component_mul(&cell_size)
}

fn corners([i, j, k]: [usize; 3]) -> [[usize; 3]; 8] {
    let mut out = [[0; 3]; 8];
    for (n, corner) in out.iter_mut().enumerate() {
        *corner = [i + (n >> 2), j + ((n >> 1) & 1), k + (n & 1)];
    }
    out
}

/// Calibrator correcting samples through a [`CalibrationGrid`].
#[derive(Debug, Clone)]
pub struct GridCalibrator {
    grid: CalibrationGrid,
    calibrate_velocity: bool,
}

impl GridCalibrator {
    pub fn new(grid: CalibrationGrid) -> Self {
        Self {
            grid,
            calibrate_velocity: false,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(CalibrationGrid::load(path)?))
    }

    /// Also rotate linear and angular velocity by the orientation correction.
    pub fn with_velocity_calibration(mut self, enabled: bool) -> Self {
        self.calibrate_velocity = enabled;
        self
    }

    pub fn grid(&self) -> &CalibrationGrid {
        &self.grid
    }
}

impl Calibrator for GridCalibrator {
    fn calibrate(&self, raw: &TrackerState) -> TrackerState {
        let Some(correction) = self.grid.interpolate(&raw.position) else {
            return *raw;
        };
        let rotation = correction.rotation();

        let mut out = *raw;
        out.position = raw.position + correction.position_offset;
        out.orientation = rotation * raw.orientation;
        if self.calibrates_velocity() {
            out.linear_velocity = rotation * raw.linear_velocity;
            out.angular_velocity = rotation * raw.angular_velocity;
        }
        out
    }

    fn calibrates_velocity(&self) -> bool {
        self.calibrate_velocity
    }
}

/// Token cursor over calibration file text that remembers line numbers.
struct Tokens<'a> {
    tokens: Vec<(usize, &'a str)>,
    next: usize,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        let tokens = text
            .lines()
            .enumerate()
            .flat_map(|(n, line)| {
                let content = line.split('#').next().unwrap_or("");
                content.split_whitespace().map(move |t| (n + 1, t))
            })
            .collect();
        Self { tokens, next: 0 }
    }

    fn remaining(&self) -> usize {
        self.tokens.len() - self.next
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.next.min(self.tokens.len().saturating_sub(1)))
            .map(|&(line, _)| line)
            .unwrap_or(0)
    }

    fn token(&mut self, what: &str) -> Result<(usize, &'a str)> {
        let token = self.tokens.get(self.next).copied().ok_or_else(|| {
            DeviceError::calibration(
                self.line(),
                format!("unexpected end of data, expected {}", what),
            )
        })?;
        self.next += 1;
        Ok(token)
    }

    fn usize(&mut self) -> Result<usize> {
        let (line, token) = self.token("grid size")?;
        token
            .parse()
            .map_err(|_| DeviceError::calibration(line, format!("invalid grid size '{}'", token)))
    }

    fn f64(&mut self) -> Result<f64> {
        let (line, token) = self.token("a number")?;
        token
            .parse()
            .map_err(|_| DeviceError::calibration(line, format!("invalid number '{}'", token)))
    }

    fn vector(&mut self) -> Result<Vector3<f64>> {
        Ok(Vector3::new(self.f64()?, self.f64()?, self.f64()?))
    }

    fn record(&mut self) -> Result<CorrectionRecord> {
        let (line, flag) = self.token("a validity flag")?;
        match flag {
            "V" | "v" | "1" | "+" => {
                let translation = self.vector()?;
                let axis = self.vector()?;
                let angle = self.f64()?;
                let orientation_offset = match Unit::try_new(axis, 1e-12) {
                    Some(axis) => axis.into_inner() * angle,
                    None => Vector3::zeros(),
                };
                Ok(CorrectionRecord::new(translation, orientation_offset))
            }
            "I" | "i" | "0" | "-" => Ok(CorrectionRecord::invalid()),
            other => Err(DeviceError::calibration(
                line,
                format!("invalid validity flag '{}'", other),
            )),
        }
    }

    fn finish(&self) -> Result<()> {
        match self.tokens.get(self.next) {
            Some(&(line, token)) => Err(DeviceError::calibration(
                line,
                format!("unexpected trailing token '{}'", token),
            )),
            None => Ok(()),
        }
    }
}
