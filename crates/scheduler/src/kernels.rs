//! Demo kernels used by `spawn-sim` and the integration tests.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};
use warpspawn_core::{Dim3, SpawnError};

use crate::device::SoftDevice;
use crate::kernel::{Kernel, KernelInvocation, ThreadContext};
use crate::launch::LaunchReport;

// ── Coverage ────────────────────────────────────────────────────────

/// Counts how many times each (group, thread) index was executed.
pub struct CoverageKernel {
    hits: Vec<AtomicU32>,
}

/// Result of checking a coverage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoverageSummary {
    pub total: u64,
    /// Indices never executed.
    pub missed: u64,
    /// Indices executed more than once.
    pub repeated: u64,
}

impl CoverageSummary {
    pub fn is_exact(&self) -> bool {
        self.missed == 0 && self.repeated == 0
    }
}

impl CoverageKernel {
    /// One counter per invocation a launch of `grid` x `block` performs. A
    /// block with a zero extent still runs one task per group.
    pub fn new(grid: Dim3, block: Dim3) -> Self {
        let total = grid.volume() * block.volume().max(1);
        Self {
            hits: (0..total).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Executions recorded for linear index `index`.
    pub fn hits(&self, index: u64) -> u32 {
        self.hits[index as usize].load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> CoverageSummary {
        let mut summary = CoverageSummary {
            total: self.hits.len() as u64,
            missed: 0,
            repeated: 0,
        };
        for h in &self.hits {
            match h.load(Ordering::Relaxed) {
                0 => summary.missed += 1,
                1 => {}
                _ => summary.repeated += 1,
            }
        }
        summary
    }
}

impl Kernel for CoverageKernel {
    fn invoke(&self, ctx: &ThreadContext) {
        self.hits[ctx.global_index() as usize].fetch_add(1, Ordering::Relaxed);
    }
}

// ── Matrix multiply ─────────────────────────────────────────────────

/// Square row-major matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    pub size: u32,
    pub data: Vec<i32>,
}

impl Matrix {
    /// Deterministic pseudo-random entries in `0..size`.
    pub fn seeded(size: u32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = size.max(1) as i32;
        let data = (0..size as u64 * size as u64)
            .map(|_| rng.gen_range(0..bound))
            .collect();
        Self { size, data }
    }

    /// Reference product on the host.
    pub fn multiply(&self, other: &Matrix) -> Matrix {
        let n = self.size as usize;
        let mut data = vec![0i32; n * n];
        for row in 0..n {
            for col in 0..n {
                let mut sum = 0i32;
                for k in 0..n {
                    sum = sum.wrapping_add(self.data[row * n + k].wrapping_mul(other.data[k * n + col]));
                }
                data[row * n + col] = sum;
            }
        }
        Matrix {
            size: self.size,
            data,
        }
    }
}

pub struct MatmulArgs<'a> {
    pub a: &'a [i32],
    pub b: &'a [i32],
    pub c: &'a [AtomicI32],
    pub size: u32,
    pub tile: u32,
}

/// One lane computes one output element.
pub fn matmul_kernel(ctx: &ThreadContext, args: &MatmulArgs<'_>) {
    let row = ctx.block_idx.y * args.tile + ctx.thread_idx.y;
    let col = ctx.block_idx.x * args.tile + ctx.thread_idx.x;
    if row >= args.size || col >= args.size {
        return;
    }
    let n = args.size as usize;
    let (row, col) = (row as usize, col as usize);
    let mut sum = 0i32;
    for k in 0..n {
        sum = sum.wrapping_add(args.a[row * n + k].wrapping_mul(args.b[k * n + col]));
    }
    args.c[row * n + col].store(sum, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct MatmulOutcome {
    pub size: u32,
    pub tile: u32,
    /// Output elements differing from the host reference.
    pub errors: usize,
    pub report: LaunchReport,
}

impl MatmulOutcome {
    pub fn passed(&self) -> bool {
        self.errors == 0
    }
}

/// Multiply two seeded `size`x`size` matrices on `device` and compare with
/// the host product. `tile == 1` launches one flat task per element; larger
/// tiles launch `tile`x`tile` groups.
pub fn run_matmul(device: &mut SoftDevice, size: u32, tile: u32) -> Result<MatmulOutcome, SpawnError> {
    let tile = tile.max(1);
    let a = Matrix::seeded(size, 1);
    let b = Matrix::seeded(size, 2);
    let expected = a.multiply(&b);
    let c: Vec<AtomicI32> = (0..expected.data.len()).map(|_| AtomicI32::new(0)).collect();

    let tiles = size.div_ceil(tile);
    let grid = Dim3::new(tiles, tiles, 1);
    let block = Dim3::new(tile, tile, 1);
    debug!(size, tile, %grid, %block, "matmul launch");

    let args = MatmulArgs {
        a: &a.data,
        b: &b.data,
        c: &c,
        size,
        tile,
    };
    let report = device.launch(grid, block, &KernelInvocation::new(matmul_kernel, &args))?;

    let errors = c
        .iter()
        .zip(&expected.data)
        .filter(|(got, want)| got.load(Ordering::Relaxed) != **want)
        .count();
    info!(size, tile, errors, "matmul verified");

    Ok(MatmulOutcome {
        size,
        tile,
        errors,
        report,
    })
}
