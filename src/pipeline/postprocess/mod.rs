//! Post-processing modules
//!
//! Both run at presentation resolution, downstream of the upscaler.

mod bloom;
mod tonemapping;

pub use bloom::*;
pub use tonemapping::*;

/// Vertex stage of every fullscreen draw: three vertices, no vertex buffer.
pub const FULLSCREEN_VERTEX_SHADER: &str = r#"
struct FullscreenVarying {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> FullscreenVarying {
    // (0,0) (2,0) (0,2) in uv space covers the viewport with one triangle
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));

    var out: FullscreenVarying;
    out.clip = vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, 0.0, 1.0);
    out.uv = uv;
    return out;
}
"#;
