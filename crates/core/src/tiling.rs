//! Overlapping tile split and weighted seam-free merge.
//!
//! Large inputs are split into overlapping tiles sized for the inference
//! model; outputs are re-accumulated with linear edge ramps so per-tile
//! inference artifacts never show up as visible seams.

use tracing::debug;

use crate::types::{PixelTensor, Tile};

/// Partition `tensor` into overlapping tiles in row-major order.
///
/// A `tile_size` of 0 yields a single tile covering the whole image.
/// `overlap` is clamped to a quarter of the tile size; the stride is
/// `tile_size - 2 * overlap`, at least 1. The last tile in each row and
/// column is pulled back so it never walks past the image bounds; where the
/// image itself is smaller than a tile, the copy is zero-filled.
pub fn split_tiles(tensor: &PixelTensor, tile_size: u32, overlap: u32) -> Vec<Tile> {
    if tensor.width == 0 || tensor.height == 0 {
        return Vec::new();
    }

    if tile_size == 0 {
        let mut tile = Tile::new(0, 0, tensor.width, tensor.height);
        tile.data.copy_from_slice(&tensor.data);
        return vec![tile];
    }

    let overlap = overlap.min(tile_size / 4);
    let stride = (tile_size - 2 * overlap).max(1);

    let mut tiles = Vec::new();
    let mut y = 0u32;
    loop {
        let ty = pull_back(y, tile_size, tensor.height);
        let mut x = 0u32;
        loop {
            let tx = pull_back(x, tile_size, tensor.width);
            tiles.push(copy_tile(tensor, tx, ty, tile_size));
            if tx + tile_size >= tensor.width {
                break;
            }
            x += stride;
        }
        if ty + tile_size >= tensor.height {
            break;
        }
        y += stride;
    }

    debug!(
        width = tensor.width,
        height = tensor.height,
        tile_size,
        overlap,
        stride,
        tiles = tiles.len(),
        "image split into tiles"
    );
    tiles
}

fn pull_back(pos: u32, tile_size: u32, extent: u32) -> u32 {
    if pos + tile_size > extent {
        extent.saturating_sub(tile_size)
    } else {
        pos
    }
}

fn copy_tile(tensor: &PixelTensor, tx: u32, ty: u32, tile_size: u32) -> Tile {
    let mut tile = Tile::new(tx, ty, tile_size, tile_size);
    let ts = tile_size as usize;
    let plane = ts * ts;
    for c in 0..3 {
        for y in 0..tile_size {
            let sy = ty + y;
            if sy >= tensor.height {
                break; // rows past the edge stay zero-filled
            }
            for x in 0..tile_size {
                let sx = tx + x;
                if sx >= tensor.width {
                    break;
                }
                tile.data[c * plane + y as usize * ts + x as usize] = tensor.get(sx, sy, c);
            }
        }
    }
    tile
}

/// Accumulates inferred tiles into one seamless output tensor.
///
/// Each tile pixel is weighted by the product of a horizontal and a
/// vertical ramp that rises linearly across the overlap band on every tile
/// edge and is 1 in the interior. After all tiles are added, every output
/// pixel is divided by its accumulated weight, so any pixel covered by at
/// least one tile normalizes to a convex blend of its contributions.
pub struct TileMerger {
    width: u32,
    height: u32,
    overlap: u32,
    accum: Vec<f32>,
    weight: Vec<f32>,
}

impl TileMerger {
    /// `overlap` is measured in output pixels.
    pub fn new(width: u32, height: u32, overlap: u32) -> Self {
        let plane = width as usize * height as usize;
        Self {
            width,
            height,
            overlap,
            accum: vec![0.0; plane * 3],
            weight: vec![0.0; plane],
        }
    }

    pub fn add(&mut self, tile: &Tile) {
        let plane = self.width as usize * self.height as usize;
        let tile_plane = tile.width as usize * tile.height as usize;
        for y in 0..tile.height {
            let dy = tile.y + y;
            if dy >= self.height {
                continue;
            }
            let wy = edge_ramp(y, tile.height, self.overlap);
            for x in 0..tile.width {
                let dx = tile.x + x;
                if dx >= self.width {
                    continue;
                }
                let w = (edge_ramp(x, tile.width, self.overlap) * wy).clamp(0.0, 1.0);
                let src = y as usize * tile.width as usize + x as usize;
                let dst = dy as usize * self.width as usize + dx as usize;
                for c in 0..3 {
                    self.accum[c * plane + dst] += tile.data[c * tile_plane + src] * w;
                }
                self.weight[dst] += w;
            }
        }
    }

    pub fn finish(self) -> PixelTensor {
        let plane = self.width as usize * self.height as usize;
        let mut out = PixelTensor::new(self.width, self.height);
        for i in 0..plane {
            let w = self.weight[i];
            if w > 0.0 {
                for c in 0..3 {
                    out.data[c * plane + i] = self.accum[c * plane + i] / w;
                }
            }
            // zero-weight pixels stay 0: the caller failed to cover the canvas
        }
        out
    }
}

/// Linear ramp over the overlap band at both ends of a tile axis.
///
/// Evaluated as `(i + 1) / (overlap + 1)` so the outermost pixel keeps a
/// strictly positive weight; a tile that alone covers a border pixel must
/// still normalize it to full value.
fn edge_ramp(i: u32, len: u32, overlap: u32) -> f32 {
    if overlap == 0 {
        return 1.0;
    }
    let band = (overlap + 1) as f32;
    let from_start = (i + 1) as f32 / band;
    let from_end = (len - i) as f32 / band;
    from_start.min(from_end).min(1.0)
}
