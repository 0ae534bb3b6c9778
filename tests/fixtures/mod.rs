//! Generated test images and job payloads.
#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use image_job_worker::models::job::{watermark_required_for, Plan, QueuedJob, Tool};
use std::io::Cursor;
use uuid::Uuid;

/// Two-tone image so resizes and watermarks are visible in pixel data.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Rgba([220, 60, 60, 255])
        } else {
            Rgba([60, 60, 220, 255])
        }
    });
    encode_png(DynamicImage::ImageRgba8(img))
}

/// Subject on a fully transparent background, as a removal provider returns.
pub fn cutout_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        let inside = x > width / 4 && x < width * 3 / 4 && y > height / 4 && y < height * 3 / 4;
        if inside {
            Rgba([240, 240, 240, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });
    encode_png(DynamicImage::ImageRgba8(img))
}

fn encode_png(img: DynamicImage) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png)
        .expect("Failed to encode fixture");
    buffer.into_inner()
}

/// A payload as the admitting API would enqueue it.
pub fn queued_job(tool: Tool, plan: Plan, options: serde_json::Value) -> QueuedJob {
    let id = Uuid::new_v4();
    QueuedJob {
        id,
        subject_id: "subject-1".to_string(),
        tool,
        plan,
        watermark_required: watermark_required_for(plan, tool),
        input_object_key: format!("inputs/{}.png", id),
        output_object_key: format!("outputs/{}", id),
        input_mime: "image/png".to_string(),
        options,
    }
}
