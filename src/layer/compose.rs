//! Tile decoding and compositing onto the output surface.
//!
//! Cached tiles are raw encoded bytes (PNG or JPEG); the layer decodes
//! them once and keeps the decoded surface in the memory cache. Ancestor
//! substitution crops the matching sub-rectangle out of a lower-zoom tile
//! and scales it up to tile size, which looks blurry but beats a hole in
//! the map.

use image::imageops::{self, FilterType};
use image::RgbaImage;

/// Decode raw tile bytes into an RGBA surface.
pub fn decode_tile(bytes: &[u8]) -> Result<RgbaImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// Cut the sub-rectangle of `ancestor` that covers a descendant tile
/// `levels` zoom steps down, at quadrant offset `(col, row)` within the
/// ancestor (see [`TileId::quadrant`]).
///
/// The result is `1/2^levels` of the ancestor's edge length; the caller
/// scales it up to draw size.
pub fn crop_ancestor(ancestor: &RgbaImage, levels: u8, quadrant: (u32, u32)) -> RgbaImage {
    let sub_w = (ancestor.width() >> levels).max(1);
    let sub_h = (ancestor.height() >> levels).max(1);
    imageops::crop_imm(ancestor, quadrant.0 * sub_w, quadrant.1 * sub_h, sub_w, sub_h).to_image()
}

/// Draw one tile onto the canvas at `(x, y)` scaled to `size` pixels per
/// edge, blended with `opacity`. Pixels falling outside the canvas are
/// clipped.
///
/// The pixel rectangle is derived by rounding the tile's fractional
/// edges, not its width: neighbors placed at accumulated fractional
/// offsets then share exact pixel boundaries, so a fractional scale
/// produces no one-pixel seams or overlaps between adjacent tiles.
pub fn draw_tile(canvas: &mut RgbaImage, tile: &RgbaImage, x: f64, y: f64, size: f64, opacity: f32) {
    let left = x.round() as i64;
    let top = y.round() as i64;
    let width = ((x + size).round() as i64 - left).max(1) as u32;
    let height = ((y + size).round() as i64 - top).max(1) as u32;
    if tile.dimensions() != (width, height) {
        let resized = imageops::resize(tile, width, height, FilterType::Triangle);
        overlay_with_opacity(canvas, &resized, left, top, opacity);
    } else {
        overlay_with_opacity(canvas, tile, left, top, opacity);
    }
}

/// Alpha-over blend of `src` onto `canvas`, with a global opacity factor
/// multiplied into the source alpha.
fn overlay_with_opacity(canvas: &mut RgbaImage, src: &RgbaImage, left: i64, top: i64, opacity: f32) {
    let opacity = opacity.clamp(0.0, 1.0);
    let (cw, ch) = (canvas.width() as i64, canvas.height() as i64);
    for (sx, sy, px) in src.enumerate_pixels() {
        let cx = left + sx as i64;
        let cy = top + sy as i64;
        if cx < 0 || cy < 0 || cx >= cw || cy >= ch {
            continue;
        }
        let sa = px[3] as f32 / 255.0 * opacity;
        if sa <= 0.0 {
            continue;
        }
        let dst = canvas.get_pixel_mut(cx as u32, cy as u32);
        let da = dst[3] as f32 / 255.0;
        let out_a = sa + da * (1.0 - sa);
        for c in 0..3 {
            let blended = px[c] as f32 * sa + dst[c] as f32 * da * (1.0 - sa);
            dst[c] = if out_a > 0.0 {
                (blended / out_a).round().min(255.0) as u8
            } else {
                0
            };
        }
        dst[3] = (out_a * 255.0).round().min(255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::TileId;
    use image::Rgba;

    fn solid(edge: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(edge, edge, Rgba(color))
    }

    fn png_bytes(img: &RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img.clone())
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn decode_roundtrips_png() {
        let img = solid(8, [10, 20, 30, 255]);
        let decoded = decode_tile(&png_bytes(&img)).unwrap();
        assert_eq!(decoded.dimensions(), (8, 8));
        assert_eq!(decoded.get_pixel(3, 3), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_tile(b"definitely not an image").is_err());
    }

    #[test]
    fn crop_picks_the_right_quadrant() {
        // Four 128px quadrants in distinct colors.
        let mut img = solid(256, [0, 0, 0, 255]);
        for y in 0..256 {
            for x in 0..256 {
                let color = match (x >= 128, y >= 128) {
                    (false, false) => [255, 0, 0, 255],
                    (true, false) => [0, 255, 0, 255],
                    (false, true) => [0, 0, 255, 255],
                    (true, true) => [255, 255, 0, 255],
                };
                img.put_pixel(x, y, Rgba(color));
            }
        }

        let ne = crop_ancestor(&img, 1, (1, 0));
        assert_eq!(ne.dimensions(), (128, 128));
        assert_eq!(ne.get_pixel(64, 64), &Rgba([0, 255, 0, 255]));

        let sw = crop_ancestor(&img, 1, (0, 1));
        assert_eq!(sw.get_pixel(64, 64), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn crop_matches_tile_quadrant_math() {
        let tile = TileId::normalized(10, 511, 300);
        let q = tile.quadrant(2);
        let img = solid(256, [1, 2, 3, 255]);
        let cropped = crop_ancestor(&img, 2, q);
        assert_eq!(cropped.dimensions(), (64, 64));
    }

    #[test]
    fn draw_at_full_opacity_replaces_pixels() {
        let mut canvas = solid(16, [0, 0, 0, 255]);
        let tile = solid(8, [200, 100, 50, 255]);
        draw_tile(&mut canvas, &tile, 4.0, 4.0, 8.0, 1.0);

        assert_eq!(canvas.get_pixel(5, 5), &Rgba([200, 100, 50, 255]));
        assert_eq!(canvas.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn draw_at_half_opacity_blends() {
        let mut canvas = solid(8, [0, 0, 0, 255]);
        let tile = solid(8, [200, 200, 200, 255]);
        draw_tile(&mut canvas, &tile, 0.0, 0.0, 8.0, 0.5);

        let px = canvas.get_pixel(4, 4);
        assert!(px[0] > 90 && px[0] < 110, "half blend, got {}", px[0]);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn draw_scales_tile_to_requested_size() {
        let mut canvas = solid(32, [0, 0, 0, 255]);
        let tile = solid(8, [255, 255, 255, 255]);
        draw_tile(&mut canvas, &tile, 0.0, 0.0, 32.0, 1.0);
        assert_eq!(canvas.get_pixel(31, 31), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn adjacent_fractional_tiles_leave_no_seams() {
        let mut canvas = solid(32, [0, 0, 0, 255]);
        let tile = solid(8, [255, 255, 255, 255]);

        // Three neighbors at a fractional step; independent rounding of
        // offset and width would leave column 20 unpainted.
        let size = 10.4;
        for i in 0..3 {
            draw_tile(&mut canvas, &tile, i as f64 * size, 0.0, size, 1.0);
        }

        let right_edge = (3.0 * size).round() as u32;
        for x in 0..right_edge {
            assert_eq!(
                canvas.get_pixel(x, 4),
                &Rgba([255, 255, 255, 255]),
                "gap at column {x}"
            );
        }
        assert_eq!(
            canvas.get_pixel(right_edge, 4),
            &Rgba([0, 0, 0, 255]),
            "no overpaint past the last tile"
        );
    }

    #[test]
    fn draw_clips_outside_canvas() {
        let mut canvas = solid(8, [0, 0, 0, 255]);
        let tile = solid(8, [255, 0, 0, 255]);
        // Hangs off every edge; must not panic.
        draw_tile(&mut canvas, &tile, -4.0, -4.0, 8.0, 1.0);
        draw_tile(&mut canvas, &tile, 6.0, 6.0, 8.0, 1.0);
        assert_eq!(canvas.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(canvas.get_pixel(7, 7), &Rgba([255, 0, 0, 255]));
    }
}
