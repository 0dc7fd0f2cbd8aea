use image::{ImageFormat, Rgb, RgbImage};

pub const RED: [u8; 3] = [220, 30, 30];
pub const BLUE: [u8; 3] = [30, 30, 220];

/// 8x8 PNG filled with `rgb`; `variant` nudges one pixel so files differ.
pub fn solid_png(rgb: [u8; 3], variant: u8) -> Vec<u8> {
    let mut img = RgbImage::from_pixel(8, 8, Rgb(rgb));
    let nudged = Rgb([
        rgb[0].saturating_add(variant),
        rgb[1],
        rgb[2].saturating_sub(variant),
    ]);
    img.put_pixel(0, 0, nudged);
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}
