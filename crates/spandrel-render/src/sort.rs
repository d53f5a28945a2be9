#![forbid(unsafe_code)]

//! Cell ordering for the rasterizer sweep.
//!
//! Cells sort by their packed coordinate key (scanline in the high bits,
//! column in the low bits), so one sort puts the whole path in sweep order.
//!
//! # Algorithm
//!
//! A hybrid quicksort: median-of-three partitioning for runs longer than a
//! small cutoff, insertion sort below it. Pending partitions go on an
//! explicit stack; the larger half is deferred and the smaller half
//! processed next, which bounds the stack depth logarithmically. Equal keys
//! may end up in any relative order; coincident cells are summed during the
//! sweep, so ties never affect output.

use crate::raster::Cell;

/// Runs at or below this length use insertion sort.
const INSERTION_CUTOFF: usize = 9;

/// Deep enough for any slice length representable on the platform.
const MAX_PENDING: usize = 48;

/// Sort cells by packed coordinate key, ascending.
pub fn sort_cells(cells: &mut [Cell]) {
    if cells.len() < 2 {
        return;
    }

    let mut pending = [(0usize, 0usize); MAX_PENDING];
    let mut top = 0;
    let mut start = 0;
    let mut end = cells.len();

    loop {
        let len = end - start;
        if len > INSERTION_CUTOFF {
            // Median-of-three: order start, middle, and last so the range
            // carries a sentinel at each end and the median as pivot.
            let mid = start + len / 2;
            cells.swap(mid, start + 1);
            if cells[start + 1].key > cells[end - 1].key {
                cells.swap(start + 1, end - 1);
            }
            if cells[start].key > cells[end - 1].key {
                cells.swap(start, end - 1);
            }
            if cells[start + 1].key > cells[start].key {
                cells.swap(start + 1, start);
            }

            let pivot = cells[start].key;
            let mut i = start + 1;
            let mut j = end - 1;
            loop {
                loop {
                    i += 1;
                    if cells[i].key >= pivot {
                        break;
                    }
                }
                loop {
                    j -= 1;
                    if cells[j].key <= pivot {
                        break;
                    }
                }
                if i > j {
                    break;
                }
                cells.swap(i, j);
            }
            cells.swap(start, j);

            // Defer the larger partition, continue with the smaller.
            debug_assert!(top < MAX_PENDING, "partition stack exhausted");
            if j - start > end - (j + 1) {
                pending[top] = (start, j);
                start = j + 1;
            } else {
                pending[top] = (j + 1, end);
                end = j;
            }
            top += 1;
        } else {
            insertion_sort(&mut cells[start..end]);
            if top == 0 {
                break;
            }
            top -= 1;
            (start, end) = pending[top];
        }
    }
}

fn insertion_sort(cells: &mut [Cell]) {
    for i in 1..cells.len() {
        let cur = cells[i];
        let mut j = i;
        while j > 0 && cells[j - 1].key > cur.key {
            cells[j] = cells[j - 1];
            j -= 1;
        }
        cells[j] = cur;
    }
}
