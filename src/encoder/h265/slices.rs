// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Splitting of a picture's CTUs into slice segments, with or without tiles.

use crate::codec::h265::parser::uniform_tile_sizes;

/// How the CTUs of a picture without tiles are distributed among slices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceRounding {
    /// Each slice is extended to end on a CTU row boundary, the last slice
    /// taking what is left. Some hardware only starts slices on a new row.
    #[default]
    RowAligned,
    /// Slices get the same number of CTUs, up to one.
    Exact,
}

/// A run of CTUs coded as one slice segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceSegment {
    /// slice_segment_address, in raster scan.
    pub address: u32,
    pub num_ctus: u32,
}

/// Splits a `ctu_width` x `ctu_height` picture into `num_slices` slices in
/// raster scan. Row alignment may produce fewer slices than requested.
pub fn partition(
    ctu_width: u32,
    ctu_height: u32,
    num_slices: u32,
    rounding: SliceRounding,
) -> Vec<SliceSegment> {
    let ctu_size = ctu_width * ctu_height;
    let num_slices = num_slices.clamp(1, ctu_size.max(1));
    let base = ctu_size / num_slices;
    let mut remainder = ctu_size % num_slices;

    let mut slices = Vec::with_capacity(num_slices as usize);
    let mut address = 0;

    while address < ctu_size && (slices.len() as u32) < num_slices {
        let mut num_ctus = base;
        if remainder > 0 {
            num_ctus += 1;
            remainder -= 1;
        }

        if rounding == SliceRounding::RowAligned {
            num_ctus = num_ctus.div_ceil(ctu_width) * ctu_width;
        }

        // The last slice absorbs whatever is left, or what overflowed.
        if slices.len() as u32 == num_slices - 1 || address + num_ctus > ctu_size {
            num_ctus = ctu_size - address;
        }

        slices.push(SliceSegment { address, num_ctus });
        address += num_ctus;
    }

    if (slices.len() as u32) < num_slices {
        log::warn!(
            "Using {} slices per picture instead of the {} requested",
            slices.len(),
            num_slices
        );
    }

    slices
}

/// Uniformly spaced tiles over a picture, in CTUs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileGrid {
    pub ctu_width: u32,
    pub ctu_height: u32,
    pub column_widths: Vec<u32>,
    pub row_heights: Vec<u32>,
}

impl TileGrid {
    pub fn uniform(ctu_width: u32, ctu_height: u32, num_cols: u32, num_rows: u32) -> Self {
        Self {
            ctu_width,
            ctu_height,
            column_widths: uniform_tile_sizes(ctu_width, num_cols),
            row_heights: uniform_tile_sizes(ctu_height, num_rows),
        }
    }

    pub fn num_tiles(&self) -> usize {
        self.column_widths.len() * self.row_heights.len()
    }

    /// Number of CTUs of each tile, in tile scan.
    fn tile_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        self.row_heights
            .iter()
            .flat_map(move |h| self.column_widths.iter().map(move |w| w * h))
    }

    /// CtbAddrTsToRs (6.5.1): the raster scan address of each CTU, indexed
    /// by its tile scan address.
    pub fn ts_to_rs(&self) -> Vec<u32> {
        let mut map = Vec::with_capacity((self.ctu_width * self.ctu_height) as usize);

        let mut y0 = 0;
        for h in &self.row_heights {
            let mut x0 = 0;
            for w in &self.column_widths {
                for y in y0..y0 + h {
                    map.extend((x0..x0 + w).map(|x| y * self.ctu_width + x));
                }
                x0 += w;
            }
            y0 += h;
        }

        map
    }

    /// Number of slices needed for `num_slices`, given that slices that
    /// cannot span tiles need at least one slice per tile.
    pub fn num_slices(&self, num_slices: u32, spans_tiles: bool) -> u32 {
        let num_tiles = self.num_tiles() as u32;
        if !spans_tiles && num_slices < num_tiles {
            log::info!("Raising the number of slices to the {} tiles", num_tiles);
            num_tiles
        } else {
            num_slices.max(1)
        }
    }

    /// Splits the picture into slices in tile scan, the returned addresses
    /// being converted back to raster scan. A slice either lies inside one
    /// tile or covers whole tiles.
    pub fn partition(&self, num_slices: u32, spans_tiles: bool) -> Vec<SliceSegment> {
        let num_slices = self.num_slices(num_slices, spans_tiles);
        let tile_sizes: Vec<u32> = self.tile_sizes().collect();
        let num_tiles = tile_sizes.len() as u32;

        // Slice start addresses and sizes in tile scan.
        let mut ts_slices: Vec<(u32, u32)> = vec![];

        if num_slices < num_tiles {
            // Runs of whole tiles, the first ones taking one more tile.
            let base = num_tiles / num_slices;
            let mut remainder = num_tiles % num_slices;
            let mut tiles = tile_sizes.iter();
            let mut address = 0;

            for _ in 0..num_slices {
                let mut count = base;
                if remainder > 0 {
                    count += 1;
                    remainder -= 1;
                }

                let num_ctus: u32 = tiles.by_ref().take(count as usize).sum();
                ts_slices.push((address, num_ctus));
                address += num_ctus;
            }
        } else {
            let mut slices_per_tile = vec![1u32; tile_sizes.len()];

            // Extra slices go to the tile with the most CTUs per slice.
            for _ in num_tiles..num_slices {
                let mut largest = 0.0f64;
                let mut target = 0;
                for (i, (size, slices)) in tile_sizes.iter().zip(&slices_per_tile).enumerate() {
                    let load = f64::from(*size) / f64::from(*slices);
                    if load > largest {
                        largest = load;
                        target = i;
                    }
                }

                slices_per_tile[target] += 1;
            }

            let mut address = 0;
            for (size, num) in tile_sizes.iter().zip(slices_per_tile) {
                for s in 0..num {
                    let num_ctus = ((s + 1) * size) / num - (s * size) / num;
                    if num_ctus > 0 {
                        ts_slices.push((address, num_ctus));
                    }
                    address += num_ctus;
                }
            }
        }

        let ts_to_rs = self.ts_to_rs();
        ts_slices
            .into_iter()
            .map(|(ts, num_ctus)| SliceSegment {
                address: ts_to_rs.get(ts as usize).copied().unwrap_or(ts),
                num_ctus,
            })
            .inspect(|s| log::trace!("Slice at CTU {} with {} CTUs", s.address, s.num_ctus))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(slices: &[(u32, u32)]) -> Vec<SliceSegment> {
        slices
            .iter()
            .map(|&(address, num_ctus)| SliceSegment { address, num_ctus })
            .collect()
    }

    #[test]
    fn single_slice() {
        assert_eq!(
            partition(60, 34, 1, SliceRounding::RowAligned),
            segments(&[(0, 2040)])
        );
        assert_eq!(partition(60, 34, 0, SliceRounding::Exact), segments(&[(0, 2040)]));
    }

    #[test]
    fn row_aligned_slices() {
        // 510 CTUs per slice are rounded up to 9 rows of 60.
        assert_eq!(
            partition(60, 34, 4, SliceRounding::RowAligned),
            segments(&[(0, 540), (540, 540), (1080, 540), (1620, 420)])
        );

        // The rounding uses up the picture before the fourth slice.
        assert_eq!(
            partition(10, 3, 4, SliceRounding::RowAligned),
            segments(&[(0, 10), (10, 10), (20, 10)])
        );
    }

    #[test]
    fn exact_slices() {
        assert_eq!(
            partition(60, 34, 4, SliceRounding::Exact),
            segments(&[(0, 510), (510, 510), (1020, 510), (1530, 510)])
        );
        assert_eq!(
            partition(10, 3, 4, SliceRounding::Exact),
            segments(&[(0, 8), (8, 8), (16, 7), (23, 7)])
        );
    }

    #[test]
    fn tile_scan_conversion() {
        let grid = TileGrid::uniform(4, 2, 2, 1);
        assert_eq!(grid.column_widths, vec![2, 2]);
        assert_eq!(grid.ts_to_rs(), vec![0, 1, 4, 5, 2, 3, 6, 7]);

        let grid = TileGrid::uniform(5, 3, 2, 2);
        assert_eq!(grid.column_widths, vec![2, 3]);
        assert_eq!(grid.row_heights, vec![1, 2]);
        assert_eq!(
            grid.ts_to_rs(),
            vec![0, 1, 2, 3, 4, 5, 6, 10, 11, 7, 8, 9, 12, 13, 14]
        );
    }

    #[test]
    fn slices_spanning_whole_tiles() {
        let grid = TileGrid::uniform(4, 4, 2, 2);
        assert_eq!(grid.ts_to_rs()[..8], [0, 1, 4, 5, 2, 3, 6, 7]);

        assert_eq!(grid.partition(1, true), segments(&[(0, 16)]));
        // Two tiles, then one each.
        assert_eq!(
            grid.partition(3, true),
            segments(&[(0, 8), (8, 4), (10, 4)])
        );

        // With as many slices as tiles or more, slices stay inside tiles.
        assert_eq!(
            grid.partition(4, true),
            segments(&[(0, 4), (2, 4), (8, 4), (10, 4)])
        );
        let grid = TileGrid::uniform(4, 2, 2, 1);
        assert_eq!(grid.partition(3, true), segments(&[(0, 2), (4, 2), (2, 4)]));
    }

    #[test]
    fn every_slice_is_inside_a_tile_or_covers_whole_tiles() {
        // 256x64 in 32x32 CTUs with two tile columns.
        let grid = TileGrid::uniform(8, 2, 2, 1);
        let tile_of = |rs: u32| if rs % 8 < 4 { 0 } else { 1 };
        let ts_of = |rs: u32| grid.ts_to_rs().iter().position(|&a| a == rs).unwrap() as u32;

        for spans_tiles in [false, true] {
            for num_slices in 1..=5 {
                let slices = grid.partition(num_slices, spans_tiles);
                assert_eq!(slices.iter().map(|s| s.num_ctus).sum::<u32>(), 16);

                for s in &slices {
                    let start = ts_of(s.address);
                    let tiles: Vec<u32> = (start..start + s.num_ctus)
                        .map(|ts| tile_of(grid.ts_to_rs()[ts as usize]))
                        .collect();
                    let whole_tiles = start % 8 == 0 && s.num_ctus % 8 == 0;
                    assert!(
                        whole_tiles || tiles.iter().all(|&t| t == tiles[0]),
                        "{num_slices} slices, spanning {spans_tiles}: {s:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn slices_inside_tiles() {
        let grid = TileGrid::uniform(6, 2, 2, 1);

        // One slice per tile at least.
        assert_eq!(grid.num_slices(1, false), 2);
        assert_eq!(grid.partition(1, false), segments(&[(0, 6), (3, 6)]));

        // The extra slice goes to the first of the equally loaded tiles.
        assert_eq!(
            grid.partition(3, false),
            segments(&[(0, 3), (6, 3), (3, 6)])
        );
    }
}
