//! Scanline filters and Adam7 geometry.

pub(super) const NONE: u8 = 0;
const SUB: u8 = 1;
const UP: u8 = 2;
const AVERAGE: u8 = 3;
const PAETH: u8 = 4;

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = i16::from(a) + i16::from(b) - i16::from(c);
    let pa = (p - i16::from(a)).abs();
    let pb = (p - i16::from(b)).abs();
    let pc = (p - i16::from(c)).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Undo `filter` on `line` in place. `prev` is the reconstructed previous
/// line of the same pass (all zero for the first). Returns `false` for an
/// unknown filter type.
pub(super) fn unfilter(filter: u8, line: &mut [u8], prev: &[u8], bpp: usize) -> bool {
    match filter {
        NONE => {}
        SUB => {
            for i in bpp..line.len() {
                line[i] = line[i].wrapping_add(line[i - bpp]);
            }
        }
        UP => {
            for (x, &b) in line.iter_mut().zip(prev) {
                *x = x.wrapping_add(b);
            }
        }
        AVERAGE => {
            for i in 0..line.len() {
                let left = if i >= bpp { u16::from(line[i - bpp]) } else { 0 };
                let avg = ((left + u16::from(prev[i])) / 2) as u8;
                line[i] = line[i].wrapping_add(avg);
            }
        }
        PAETH => {
            for i in 0..line.len() {
                let (a, c) = if i >= bpp {
                    (line[i - bpp], prev[i - bpp])
                } else {
                    (0, 0)
                };
                line[i] = line[i].wrapping_add(paeth(a, prev[i], c));
            }
        }
        _ => return false,
    }
    true
}

fn apply(filter: u8, line: &[u8], prev: &[u8], bpp: usize, out: &mut Vec<u8>) {
    out.clear();
    out.extend(line.iter().enumerate().map(|(i, &x)| {
        let a = if i >= bpp { line[i - bpp] } else { 0 };
        let b = prev[i];
        let c = if i >= bpp { prev[i - bpp] } else { 0 };
        let predicted = match filter {
            SUB => a,
            UP => b,
            AVERAGE => ((u16::from(a) + u16::from(b)) / 2) as u8,
            PAETH => paeth(a, b, c),
            _ => 0,
        };
        x.wrapping_sub(predicted)
    }));
}

/// Filter `line`, choosing the type with the smallest sum of absolute
/// residuals. Appends the filter byte and the filtered bytes to `out`.
pub(super) fn filter_adaptive(line: &[u8], prev: &[u8], bpp: usize, out: &mut Vec<u8>) {
    let mut best = (NONE, u64::MAX, Vec::new());
    let mut scratch = Vec::with_capacity(line.len());
    for filter in [NONE, SUB, UP, AVERAGE, PAETH] {
        apply(filter, line, prev, bpp, &mut scratch);
        let cost: u64 = scratch
            .iter()
            .map(|&b| u64::from((b as i8).unsigned_abs()))
            .sum();
        if cost < best.1 {
            best = (filter, cost, scratch.clone());
        }
    }
    out.push(best.0);
    out.extend_from_slice(&best.2);
}

/// One Adam7 pass: origin, step and resulting sub-image size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Pass {
    pub x0: u32,
    pub y0: u32,
    pub dx: u32,
    pub dy: u32,
    pub width: u32,
    pub height: u32,
}

const ADAM7: [(u32, u32, u32, u32); 7] = [
    (0, 0, 8, 8),
    (4, 0, 8, 8),
    (0, 4, 4, 8),
    (2, 0, 4, 4),
    (0, 2, 2, 4),
    (1, 0, 2, 2),
    (0, 1, 1, 2),
];

fn span(size: u32, origin: u32, step: u32) -> u32 {
    if size > origin {
        (size - origin).div_ceil(step)
    } else {
        0
    }
}

pub(super) fn adam7(width: u32, height: u32) -> Vec<Pass> {
    ADAM7
        .iter()
        .map(|&(x0, y0, dx, dy)| Pass {
            x0,
            y0,
            dx,
            dy,
            width: span(width, x0, dx),
            height: span(height, y0, dy),
        })
        .collect()
}

pub(super) fn single(width: u32, height: u32) -> Vec<Pass> {
    vec![Pass {
        x0: 0,
        y0: 0,
        dx: 1,
        dy: 1,
        width,
        height,
    }]
}
