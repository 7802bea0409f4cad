//! QR rendering for the pairing endpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Luma};
use qrcode::QrCode;

use warelay_gateway::server::QrRenderer;

/// Renders a pairing payload as a `data:image/png;base64,...` URL, ready to
/// drop into an `<img>` tag.
pub struct PngQrRenderer;

impl QrRenderer for PngQrRenderer {
    fn render(&self, payload: &str) -> anyhow::Result<String> {
        let code = QrCode::new(payload.as_bytes())?;
        let img = code.render::<Luma<u8>>().build();

        let mut png = Vec::new();
        PngEncoder::new(&mut png).write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::L8,
        )?;

        Ok(format!("data:image/png;base64,{}", STANDARD.encode(&png)))
    }
}
