#![forbid(unsafe_code)]

//! Antialiased vector-path rasterization.
//!
//! Paths enter as `move_to`/`line_to` calls in 24.8 fixed-point
//! coordinates. Each segment is decomposed per scanline into the cells it
//! touches; a cell accumulates the signed vertical extent the segment
//! crosses (`cover`, in 1/256 units) and that extent integrated over the
//! cell's horizontal span (`area`). Rendering sorts the cells into
//! scanline order, carries a running cover total across each row, derives
//! per-pixel alpha from the accumulated area, gamma-corrects it, and
//! blends one scanline at a time into the framebuffer.
//!
//! # State machine
//!
//! Empty → Building (any `move_to`/`line_to`) → Sorted (lazily, before the
//! sweep) → consumed by `render`, which always returns the path to Empty.
//! A path with zero cells renders as a no-op.
//!
//! # Coordinate range
//!
//! Cell keys pack the pixel coordinate into 16 bits per axis. Incoming
//! coordinates are clamped to `[0, i16::MAX]` pixels, so off-surface
//! geometry flattens onto the edge instead of wrapping the sort key.

use smallvec::SmallVec;

use crate::buffer::Framebuffer;
use crate::config::RenderConfig;
use crate::gamma::GammaTable;
use crate::pixel::Rgb565;
use crate::sort::sort_cells;
use spandrel_core::fixed::{FIXED_MASK, FIXED_ONE, FIXED_SHIFT, Fixed};
use spandrel_core::geometry::Rect;

/// Largest accepted coordinate: pixel `i16::MAX`, fraction 255.
const MAX_COORD: Fixed = ((i16::MAX as i32) << FIXED_SHIFT) | FIXED_MASK;

/// A key no real cell can carry (y would exceed the clamped range).
const SENTINEL_KEY: u32 = u32::MAX;

/// How overlapping coverage folds into opacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillRule {
    /// Any nonzero winding is inside.
    #[default]
    NonZero,
    /// Odd winding counts are inside, even counts are holes.
    EvenOdd,
}

/// One pixel's coverage accumulator.
///
/// The key packs the coordinate as `(y << 16) | x`, so sorting by key alone
/// yields scanline-major, column-minor order. Several cells may share a key;
/// the sweep sums them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    /// Packed coordinate: y in the high 16 bits, x in the low 16.
    pub key: u32,
    /// Signed vertical extent crossed, in 1/256 units.
    pub cover: i32,
    /// Cover integrated over the cell's horizontal extent.
    pub area: i32,
}

impl Cell {
    /// Create a cell at a pixel coordinate.
    #[inline]
    pub const fn new(x: i32, y: i32, cover: i32, area: i32) -> Self {
        Self {
            key: pack_key(x, y),
            cover,
            area,
        }
    }

    /// Column of this cell.
    #[inline]
    pub const fn x(&self) -> i32 {
        (self.key & 0xFFFF) as i32
    }

    /// Scanline of this cell.
    #[inline]
    pub const fn y(&self) -> i32 {
        (self.key >> 16) as i32
    }
}

#[inline]
const fn pack_key(x: i32, y: i32) -> u32 {
    ((y as u32) << 16) | (x as u32 & 0xFFFF)
}

/// Block-growable cell storage.
///
/// Growth happens in fixed-size reservations; `clear` keeps the capacity so
/// steady-state rendering never touches the allocator.
#[derive(Debug)]
struct CellArena {
    cells: Vec<Cell>,
    block: usize,
}

impl CellArena {
    fn new(block: usize) -> Self {
        Self {
            cells: Vec::new(),
            block: block.max(1),
        }
    }

    #[inline]
    fn push(&mut self, cell: Cell) {
        if self.cells.len() == self.cells.capacity() {
            self.cells.reserve_exact(self.block);
        }
        self.cells.push(cell);
    }

    fn clear(&mut self) {
        self.cells.clear();
    }
}

/// Marker for "no pixel emitted yet on this scanline".
const LAST_X_NONE: i32 = i32::MIN / 2;

#[derive(Debug, Clone, Copy)]
struct Run {
    x: i32,
    len: u32,
    cover_start: u32,
}

/// One scanline's pending output: runs plus a per-pixel coverage array.
///
/// Bounded to a single row; flushed into the framebuffer as soon as the
/// sweep moves to the next scanline. Both arrays keep their capacity
/// across rows and across frames.
#[derive(Debug, Default)]
struct ScanlineBuf {
    runs: SmallVec<[Run; 16]>,
    covers: Vec<u8>,
    last_x: i32,
}

impl ScanlineBuf {
    fn reset(&mut self) {
        self.runs.clear();
        self.covers.clear();
        self.last_x = LAST_X_NONE;
    }

    #[inline]
    fn push_cell(&mut self, x: i32, alpha: u8) {
        if x == self.last_x + 1
            && let Some(run) = self.runs.last_mut()
        {
            run.len += 1;
        } else {
            self.runs.push(Run {
                x,
                len: 1,
                cover_start: self.covers.len() as u32,
            });
        }
        self.covers.push(alpha);
        self.last_x = x;
    }

    #[inline]
    fn push_span(&mut self, x: i32, len: i32, alpha: u8) {
        debug_assert!(len > 0);
        if x == self.last_x + 1
            && let Some(run) = self.runs.last_mut()
        {
            run.len += len as u32;
        } else {
            self.runs.push(Run {
                x,
                len: len as u32,
                cover_start: self.covers.len() as u32,
            });
        }
        self.covers.resize(self.covers.len() + len as usize, alpha);
        self.last_x = x + len - 1;
    }
}

/// Antialiased scanline rasterizer for solid-color fills.
///
/// # Example
///
/// ```
/// use spandrel_core::fixed::from_int;
/// use spandrel_render::buffer::Framebuffer;
/// use spandrel_render::config::RenderConfig;
/// use spandrel_render::pixel::Rgb565;
/// use spandrel_render::raster::{FillRule, Rasterizer};
///
/// let mut frame = Framebuffer::new(32, 32);
/// let mut ras = Rasterizer::new(&RenderConfig::default());
/// ras.move_to(from_int(4), from_int(4));
/// ras.line_to(from_int(28), from_int(4));
/// ras.line_to(from_int(28), from_int(28));
/// ras.line_to(from_int(4), from_int(28));
/// ras.render(Rgb565::WHITE, FillRule::NonZero, &mut frame);
/// assert_eq!(frame.get(16, 16), Some(Rgb565::WHITE));
/// ```
#[derive(Debug)]
pub struct Rasterizer {
    arena: CellArena,
    curr: Cell,
    x0: Fixed,
    y0: Fixed,
    start_x: Fixed,
    start_y: Fixed,
    open: bool,
    sorted: bool,
    min_x: i32,
    min_y: i32,
    max_x: i32,
    max_y: i32,
    gamma: GammaTable,
    scanline: ScanlineBuf,
}

impl Rasterizer {
    /// Create a rasterizer; the gamma table and arena growth quantum come
    /// from the configuration.
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            arena: CellArena::new(config.cell_block),
            curr: Cell {
                key: SENTINEL_KEY,
                cover: 0,
                area: 0,
            },
            x0: 0,
            y0: 0,
            start_x: 0,
            start_y: 0,
            open: false,
            sorted: false,
            min_x: i32::MAX,
            min_y: i32::MAX,
            max_x: i32::MIN,
            max_y: i32::MIN,
            gamma: GammaTable::new(config.gamma),
            scanline: ScanlineBuf::default(),
        }
    }

    /// Begin a new subpath, implicitly closing any open one back to its
    /// start point first.
    pub fn move_to(&mut self, x: Fixed, y: Fixed) {
        let x = clamp_coord(x);
        let y = clamp_coord(y);
        self.close_subpath();
        self.start_x = x;
        self.start_y = y;
        self.x0 = x;
        self.y0 = y;
    }

    /// Extend the current subpath with a straight segment.
    pub fn line_to(&mut self, x: Fixed, y: Fixed) {
        let x = clamp_coord(x);
        let y = clamp_coord(y);
        self.line(self.x0, self.y0, x, y);
        self.x0 = x;
        self.y0 = y;
        self.open = true;
        self.sorted = false;
    }

    /// Check if the accumulated path has produced no cells.
    pub fn is_empty(&self) -> bool {
        self.arena.cells.is_empty() && self.curr.cover == 0 && self.curr.area == 0
    }

    /// Pixel bounding box of the accumulated path, `None` while empty.
    pub fn bounds(&self) -> Option<Rect> {
        if self.min_x > self.max_x || self.min_y > self.max_y {
            return None;
        }
        Some(Rect::new(
            self.min_x as i16,
            self.min_y as i16,
            (self.max_x + 1).min(i16::MAX as i32) as i16,
            (self.max_y + 1).min(i16::MAX as i32) as i16,
        ))
    }

    /// Abandon the accumulated path without rendering it.
    pub fn reset(&mut self) {
        self.reset_path();
    }

    /// Rasterize the accumulated path as a solid fill and reset to Empty.
    ///
    /// An open subpath is closed first. Pixels outside the framebuffer are
    /// dropped during the flush.
    pub fn render(&mut self, color: Rgb565, rule: FillRule, frame: &mut Framebuffer) {
        self.close_subpath();
        self.flush_curr();

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!("raster_render", cells = self.arena.cells.len());
        #[cfg(feature = "tracing")]
        let _guard = _span.enter();

        if !self.sorted {
            sort_cells(&mut self.arena.cells);
            self.sorted = true;
        }

        if !self.arena.cells.is_empty() {
            self.sweep(color, rule, frame);
        }
        self.reset_path();
    }

    /// Walk sorted cells scanline by scanline, emitting and flushing runs.
    fn sweep(&mut self, color: Rgb565, rule: FillRule, frame: &mut Framebuffer) {
        let mut scanline = std::mem::take(&mut self.scanline);
        let cells = &self.arena.cells;
        let n = cells.len();
        let mut i = 0;

        while i < n {
            let y = cells[i].y();
            scanline.reset();
            let mut cover: i32 = 0;

            while i < n && cells[i].y() == y {
                let key = cells[i].key;
                let x = cells[i].x();
                let mut area = cells[i].area;
                cover += cells[i].cover;
                i += 1;

                // Coincident cells merge here; sort ties are irrelevant.
                while i < n && cells[i].key == key {
                    area += cells[i].area;
                    cover += cells[i].cover;
                    i += 1;
                }

                if area != 0 {
                    let alpha =
                        self.alpha_from_area((cover << (FIXED_SHIFT + 1)) - area, rule);
                    if alpha > 0 {
                        scanline.push_cell(x, alpha);
                    }
                }

                // Interior run with uniform cover up to the next cell.
                if i < n && cells[i].y() == y {
                    let run_start = if area != 0 { x + 1 } else { x };
                    let next_x = cells[i].x();
                    if next_x > run_start {
                        let alpha = self.alpha_from_area(cover << (FIXED_SHIFT + 1), rule);
                        if alpha > 0 {
                            scanline.push_span(run_start, next_x - run_start, alpha);
                        }
                    }
                }
            }

            flush_scanline(&scanline, y, color, frame);
        }

        self.scanline = scanline;
    }

    /// Derive 0..=255 alpha from an accumulated area term, apply the fill
    /// rule, then the gamma table.
    #[inline]
    fn alpha_from_area(&self, area: i32, rule: FillRule) -> u8 {
        // 2 * FIXED_SHIFT + 1 - 8 = 9: back into the 8-bit coverage domain.
        let mut cover = (area >> (2 * FIXED_SHIFT + 1 - 8)).unsigned_abs();
        match rule {
            FillRule::NonZero => {
                if cover > 255 {
                    cover = 255;
                }
            }
            FillRule::EvenOdd => {
                cover &= 511;
                if cover > 256 {
                    cover = 512 - cover;
                }
                if cover > 255 {
                    cover = 255;
                }
            }
        }
        self.gamma.apply(cover as u8)
    }

    fn reset_path(&mut self) {
        self.arena.clear();
        self.curr = Cell {
            key: SENTINEL_KEY,
            cover: 0,
            area: 0,
        };
        self.x0 = 0;
        self.y0 = 0;
        self.start_x = 0;
        self.start_y = 0;
        self.open = false;
        self.sorted = false;
        self.min_x = i32::MAX;
        self.min_y = i32::MAX;
        self.max_x = i32::MIN;
        self.max_y = i32::MIN;
    }

    fn close_subpath(&mut self) {
        if self.open {
            self.line(self.x0, self.y0, self.start_x, self.start_y);
            self.x0 = self.start_x;
            self.y0 = self.start_y;
            self.open = false;
        }
    }

    #[inline]
    fn set_curr_cell(&mut self, ex: i32, ey: i32) {
        let key = pack_key(ex, ey);
        if key != self.curr.key {
            self.flush_curr();
            self.curr.key = key;
        }
    }

    #[inline]
    fn flush_curr(&mut self) {
        if self.curr.cover != 0 || self.curr.area != 0 {
            self.arena.push(self.curr);
            self.curr.cover = 0;
            self.curr.area = 0;
        }
    }

    /// Accumulate one segment into cells.
    fn line(&mut self, x1: Fixed, y1: Fixed, x2: Fixed, y2: Fixed) {
        // Split very wide segments so the per-scanline DDA stays in range.
        const DX_LIMIT: i64 = (16384 << FIXED_SHIFT) as i64;

        let dx = x2 as i64 - x1 as i64;
        if dx >= DX_LIMIT || dx <= -DX_LIMIT {
            let cx = ((x1 as i64 + x2 as i64) >> 1) as Fixed;
            let cy = ((y1 as i64 + y2 as i64) >> 1) as Fixed;
            self.line(x1, y1, cx, cy);
            self.line(cx, cy, x2, y2);
            return;
        }

        let dy = y2 as i64 - y1 as i64;
        let scale = FIXED_ONE as i64;
        let ex1 = (x1 >> FIXED_SHIFT) as i64;
        let ex2 = (x2 >> FIXED_SHIFT) as i64;
        let ey1 = (y1 >> FIXED_SHIFT) as i64;
        let ey2 = (y2 >> FIXED_SHIFT) as i64;
        let fy1 = (y1 & FIXED_MASK) as i64;
        let fy2 = (y2 & FIXED_MASK) as i64;

        self.min_x = self.min_x.min(ex1.min(ex2) as i32);
        self.max_x = self.max_x.max(ex1.max(ex2) as i32);
        self.min_y = self.min_y.min(ey1.min(ey2) as i32);
        self.max_y = self.max_y.max(ey1.max(ey2) as i32);

        self.set_curr_cell(ex1 as i32, ey1 as i32);

        // Whole segment within one scanline.
        if ey1 == ey2 {
            self.hline(ey1 as i32, x1 as i64, fy1, x2 as i64, fy2);
            return;
        }

        // Vertical segment: walk rows within a single cell column.
        if dx == 0 {
            let ex = (x1 >> FIXED_SHIFT) as i32;
            let two_fx = ((x1 & FIXED_MASK) as i64) << 1;

            let (first, incr): (i64, i64) = if dy < 0 { (0, -1) } else { (scale, 1) };
            let mut delta = first - fy1;
            self.curr.cover += delta as i32;
            self.curr.area += (two_fx * delta) as i32;

            let mut ey = ey1 + incr;
            self.set_curr_cell(ex, ey as i32);

            delta = first + first - scale;
            let area = two_fx * delta;
            while ey != ey2 {
                self.curr.cover += delta as i32;
                self.curr.area += area as i32;
                ey += incr;
                self.set_curr_cell(ex, ey as i32);
            }
            delta = fy2 - scale + first;
            self.curr.cover += delta as i32;
            self.curr.area += (two_fx * delta) as i32;
            return;
        }

        // General case: one horizontal slice per crossed scanline.
        let (mut p, first, incr): (i64, i64, i64) = if dy < 0 {
            (fy1 * dx, 0, -1)
        } else {
            ((scale - fy1) * dx, scale, 1)
        };
        let dy_abs = dy.abs();

        let mut delta = p / dy_abs;
        let mut modulus = p % dy_abs;
        if modulus < 0 {
            delta -= 1;
            modulus += dy_abs;
        }

        let mut x_from = x1 as i64 + delta;
        self.hline(ey1 as i32, x1 as i64, fy1, x_from, first);

        let mut ey = ey1 + incr;
        self.set_curr_cell((x_from >> FIXED_SHIFT) as i32, ey as i32);

        if ey != ey2 {
            p = scale * dx;
            let mut lift = p / dy_abs;
            let mut rem = p % dy_abs;
            if rem < 0 {
                lift -= 1;
                rem += dy_abs;
            }
            modulus -= dy_abs;

            while ey != ey2 {
                delta = lift;
                modulus += rem;
                if modulus >= 0 {
                    modulus -= dy_abs;
                    delta += 1;
                }
                let x_to = x_from + delta;
                self.hline(ey as i32, x_from, scale - first, x_to, first);
                x_from = x_to;
                ey += incr;
                self.set_curr_cell((x_from >> FIXED_SHIFT) as i32, ey as i32);
            }
        }
        self.hline(ey as i32, x_from, scale - first, x2 as i64, fy2);
    }

    /// Accumulate one sub-segment confined to scanline `ey`.
    ///
    /// `fy1`/`fy2` are the segment's vertical sub-pixel positions within
    /// the scanline, in `0..=256`.
    fn hline(&mut self, ey: i32, x1: i64, fy1: i64, x2: i64, fy2: i64) {
        let scale = FIXED_ONE as i64;
        let mask = FIXED_MASK as i64;

        let mut ex1 = x1 >> FIXED_SHIFT;
        let ex2 = x2 >> FIXED_SHIFT;
        let fx1 = x1 & mask;
        let fx2 = x2 & mask;

        // Flat sub-segment: no vertical extent, nothing to accumulate.
        if fy1 == fy2 {
            self.set_curr_cell(ex2 as i32, ey);
            return;
        }

        // Confined to a single cell.
        if ex1 == ex2 {
            let delta = fy2 - fy1;
            self.curr.cover += delta as i32;
            self.curr.area += ((fx1 + fx2) * delta) as i32;
            return;
        }

        // Crosses cell boundaries: run a DDA over the columns.
        let (mut p, first, incr, dx): (i64, i64, i64, i64) = if x2 - x1 < 0 {
            (fx1 * (fy2 - fy1), 0, -1, x1 - x2)
        } else {
            ((scale - fx1) * (fy2 - fy1), scale, 1, x2 - x1)
        };

        let mut delta = p / dx;
        let mut modulus = p % dx;
        if modulus < 0 {
            delta -= 1;
            modulus += dx;
        }

        self.curr.cover += delta as i32;
        self.curr.area += ((fx1 + first) * delta) as i32;

        ex1 += incr;
        self.set_curr_cell(ex1 as i32, ey);
        let mut fy = fy1 + delta;

        if ex1 != ex2 {
            p = scale * (fy2 - fy1);
            let mut lift = p / dx;
            let mut rem = p % dx;
            if rem < 0 {
                lift -= 1;
                rem += dx;
            }
            modulus -= dx;

            while ex1 != ex2 {
                delta = lift;
                modulus += rem;
                if modulus >= 0 {
                    modulus -= dx;
                    delta += 1;
                }
                self.curr.cover += delta as i32;
                self.curr.area += (scale * delta) as i32;
                fy += delta;
                ex1 += incr;
                self.set_curr_cell(ex1 as i32, ey);
            }
        }
        let delta = fy2 - fy;
        self.curr.cover += delta as i32;
        self.curr.area += ((fx2 + scale - first) * delta) as i32;
    }
}

impl Default for Rasterizer {
    fn default() -> Self {
        Self::new(&RenderConfig::default())
    }
}

#[inline]
fn clamp_coord(v: Fixed) -> Fixed {
    v.clamp(0, MAX_COORD)
}

/// Blend one finished scanline into the framebuffer, clipping to bounds.
fn flush_scanline(scanline: &ScanlineBuf, y: i32, color: Rgb565, frame: &mut Framebuffer) {
    if y < 0 || y >= frame.height() as i32 {
        return;
    }
    let width = frame.width() as i32;
    let row = frame.row_mut(y as u16);
    for run in &scanline.runs {
        for k in 0..run.len {
            let x = run.x + k as i32;
            if x < 0 || x >= width {
                continue;
            }
            let alpha = scanline.covers[(run.cover_start + k) as usize];
            if alpha == 0 {
                continue;
            }
            let px = &mut row[x as usize];
            *px = px.blend(color, alpha);
        }
    }
}
