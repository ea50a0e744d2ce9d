//! GPU integration tests on a headless wgpu backend.
//!
//! Each test renders offscreen and reads the result back. When no adapter is
//! available the test prints a message and returns early.
//!
//! ```bash
//! cargo test --test gpu_tests -- --nocapture
//! ```

mod common;

use glam::Vec3;
use rstest::rstest;

use asteroid_field::backend::{GraphicsBackend, TextureFormat};
use asteroid_field::error::RenderError;
use asteroid_field::pipeline::{choose_sample_count, FrameParams, FrameRenderer, OffscreenTarget, TargetState};
use asteroid_field::scene::Camera;

use common::{assert_pixel_near, build_scene, headless, pixel, quad, shader_dir, SceneSpec};

const SIZE: u32 = 64;

/// Clear through the multisampled target and read the resolved texture back.
#[rstest]
#[case::single_sample(1)]
#[case::msaa(4)]
fn resolved_texture_holds_the_scene_clear_color(#[case] requested: u32) {
    let Some(mut backend) = headless(SIZE, SIZE) else {
        return;
    };

    let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
    let samples = choose_sample_count(&backend, target.color_format(), target.depth_format(), requested);
    target.create(&mut backend, SIZE, SIZE, samples).unwrap();

    backend.begin_frame().unwrap();
    let pass = target.scene_pass([1.0, 0.0, 0.0, 1.0]).unwrap();
    backend.begin_render_pass(&pass);
    backend.end_render_pass();
    target.resolve(&mut backend).unwrap();
    backend.end_frame().unwrap();

    let pixels = backend.read_texture(target.resolve_texture().unwrap()).unwrap();
    assert_eq!(pixels.len(), (SIZE * SIZE * 4) as usize);
    for (x, y) in [(0, 0), (SIZE / 2, SIZE / 2), (SIZE - 1, SIZE - 1)] {
        assert_pixel_near(pixel(&pixels, SIZE, x, y), [255, 0, 0, 255], 1);
    }

    target.destroy(&mut backend);
}

fn render_and_read(spec: SceneSpec) -> Option<Vec<u8>> {
    let mut backend = headless(SIZE, SIZE)?;
    let scene = build_scene(&mut backend, spec);
    let mut renderer = FrameRenderer::new(&mut backend, scene, &shader_dir(), 4, FrameParams::default()).unwrap();

    // At the origin facing -Z; elapsed 0 leaves the planet unrotated
    renderer.render(&mut backend, &Camera::new(Vec3::ZERO), 0.0).unwrap();
    let presented = backend.presentation_texture().unwrap();
    let pixels = backend.read_texture(presented).unwrap();

    backend.wait_idle();
    renderer.destroy(&mut backend);
    Some(pixels)
}

#[test]
fn skybox_fills_an_empty_scene() {
    let spec = SceneSpec {
        planet_meshes: Vec::new(),
        rock_meshes: Vec::new(),
        asteroid_count: 0,
        sky_rgba: [0, 0, 255, 255],
        ..Default::default()
    };
    let Some(pixels) = render_and_read(spec) else {
        return;
    };
    // The cube sits exactly on the far plane and must still pass the depth test
    for (x, y) in [(1, 1), (SIZE / 2, SIZE / 2), (SIZE - 2, SIZE / 3)] {
        assert_pixel_near(pixel(&pixels, SIZE, x, y), [0, 0, 255, 255], 2);
    }
}

#[test]
fn skybox_stays_behind_scene_geometry() {
    // Planet scale 10 puts this quad at z = -50, covering the whole view
    let spec = SceneSpec {
        planet_meshes: vec![quad("wall", 20.0, -5.0)],
        rock_meshes: Vec::new(),
        asteroid_count: 0,
        sky_rgba: [0, 0, 255, 255],
        ..Default::default()
    };
    let Some(pixels) = render_and_read(spec) else {
        return;
    };
    // The wall faces away from the light, so only the 0.1 ambient term lights it
    assert_pixel_near(pixel(&pixels, SIZE, SIZE / 2, SIZE / 2), [26, 26, 26, 255], 3);
}

#[rstest]
#[case::zero_width(0, SIZE)]
#[case::zero_height(SIZE, 0)]
fn zero_sized_target_is_rejected(#[case] width: u32, #[case] height: u32) {
    let Some(mut backend) = headless(SIZE, SIZE) else {
        return;
    };
    let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
    let err = target.create(&mut backend, width, height, 1).unwrap_err();
    assert!(matches!(err, RenderError::FramebufferIncomplete(_)));
    assert_eq!(target.state(), TargetState::Unconfigured);
    assert!(target.resolve_view().is_err());
}

#[test]
fn oversized_target_is_rejected() {
    let Some(mut backend) = headless(SIZE, SIZE) else {
        return;
    };
    let too_big = backend.max_texture_dimension() + 1;
    let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
    let err = target.create(&mut backend, too_big, SIZE, 1).unwrap_err();
    assert!(matches!(err, RenderError::FramebufferIncomplete(_)));
}
