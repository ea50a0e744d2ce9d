//! Frame structure tests on the recording backend.
//!
//! These assert the order of passes and draws, instanced draw counts and
//! teardown discipline without a GPU.

mod common;

use std::path::Path;

use rstest::rstest;

use asteroid_field::app::load_scene;
use asteroid_field::backend::{GraphicsBackend, RecordedCommand, RecordingBackend, ResourceKind};
use asteroid_field::error::RenderError;
use asteroid_field::pipeline::{FrameParams, FrameRenderer, TargetState};
use asteroid_field::scene::Camera;
use asteroid_field::AppConfig;
use glam::Vec3;

use common::{build_scene, shader_dir, MemorySource, SceneSpec};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 180;

fn renderer(backend: &mut RecordingBackend, spec: SceneSpec, samples: u32) -> FrameRenderer<MemorySource> {
    let scene = build_scene(backend, spec);
    FrameRenderer::new(backend, scene, &shader_dir(), samples, FrameParams::default()).unwrap()
}

fn camera() -> Camera {
    Camera::new(Vec3::new(-600.0, 0.0, -150.0)).look_at(Vec3::ZERO)
}

/// Render one frame and return only the commands it recorded
fn record_frame(backend: &mut RecordingBackend, renderer: &mut FrameRenderer<MemorySource>) -> Vec<RecordedCommand> {
    backend.clear_commands();
    renderer.render(backend, &camera(), 1.5).unwrap();
    backend.commands().to_vec()
}

/// Split the frame's commands into passes, each starting at its BeginRenderPass
fn passes(commands: &[RecordedCommand]) -> Vec<&[RecordedCommand]> {
    let mut passes = Vec::new();
    let mut start = None;
    for (i, command) in commands.iter().enumerate() {
        match command {
            RecordedCommand::BeginRenderPass { .. } => start = Some(i),
            RecordedCommand::EndRenderPass => {
                if let Some(s) = start.take() {
                    passes.push(&commands[s..=i]);
                }
            }
            _ => {}
        }
    }
    passes
}

#[rstest]
#[case::msaa(8, 8)]
#[case::fallback(16, 8)]
#[case::single_sample(1, 1)]
fn frame_is_scene_then_resolve_then_composite(#[case] requested: u32, #[case] expected: u32) {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let mut renderer = renderer(&mut backend, SceneSpec::default(), requested);
    assert_eq!(renderer.target().sample_count(), Some(expected));

    let commands = record_frame(&mut backend, &mut renderer);
    assert_eq!(commands.first(), Some(&RecordedCommand::BeginFrame));
    assert_eq!(commands.last(), Some(&RecordedCommand::EndFrame));

    let passes = passes(&commands);
    let resolve_view = renderer.target().resolve_view().unwrap();
    let swapchain = backend.swapchain_view();

    let RecordedCommand::BeginRenderPass {
        depth_view, resolve_targets, ..
    } = &passes[0][0]
    else {
        unreachable!()
    };
    assert!(depth_view.is_some(), "scene pass needs depth");
    assert_eq!(resolve_targets, &vec![None]);

    if expected > 1 {
        assert_eq!(passes.len(), 3);
        let RecordedCommand::BeginRenderPass {
            resolve_targets,
            depth_view,
            color_load,
            ..
        } = &passes[1][0]
        else {
            unreachable!()
        };
        assert_eq!(resolve_targets, &vec![Some(resolve_view)]);
        assert!(depth_view.is_none());
        assert_eq!(color_load, &vec![asteroid_field::backend::LoadOp::Load]);
    } else {
        assert_eq!(passes.len(), 2);
        let copy = commands
            .iter()
            .position(|c| matches!(c, RecordedCommand::CopyTexture { .. }))
            .expect("single-sample frames copy instead of resolving");
        let scene_end = commands.iter().position(|c| *c == RecordedCommand::EndRenderPass).unwrap();
        assert!(copy > scene_end);
    }

    let composite = passes.last().unwrap();
    let RecordedCommand::BeginRenderPass {
        color_views, depth_view, ..
    } = &composite[0]
    else {
        unreachable!()
    };
    assert_eq!(color_views, &vec![swapchain]);
    assert!(depth_view.is_none());
    assert!(composite.contains(&RecordedCommand::Draw {
        vertices: 0..6,
        instances: 0..1,
    }));
}

#[test]
fn asteroids_are_one_instanced_draw_per_mesh() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let spec = SceneSpec {
        rock_meshes: vec![common::quad("rock-a", 0.3, 0.0), common::quad("rock-b", 0.2, 0.1)],
        asteroid_count: 1000,
        ..Default::default()
    };
    let mut renderer = renderer(&mut backend, spec, 4);
    let commands = record_frame(&mut backend, &mut renderer);
    let scene = passes(&commands)[0];

    let instanced: Vec<_> = scene
        .iter()
        .filter(|c| matches!(c, RecordedCommand::DrawIndexed { instances, .. } if instances.end > 1))
        .collect();
    assert_eq!(instanced.len(), 2);
    for draw in instanced {
        assert!(matches!(draw, RecordedCommand::DrawIndexed { instances, .. } if *instances == (0..1000)));
    }

    // Instance buffers sit on slots 1 and 2 for every asteroid draw
    let instance_slots = scene
        .iter()
        .filter(|c| matches!(c, RecordedCommand::SetVertexBuffer { slot: 1 | 2, .. }))
        .count();
    assert_eq!(instance_slots, 4);
}

#[test]
fn asteroids_bind_a_light_only_group() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let mut renderer = renderer(&mut backend, SceneSpec::default(), 4);

    let asteroids = backend
        .pipeline_descriptor(renderer.programs().asteroids.pipeline)
        .unwrap();
    assert_eq!(asteroids.bind_group_layouts[1], renderer.programs().layouts.light);
    let labels: Vec<_> = backend.live_resources().into_iter().map(|(_, label)| label).collect();
    assert!(labels.iter().any(|l| l == "Asteroid Light"));
    assert!(!labels.iter().any(|l| l == "Asteroid Object"));

    let commands = record_frame(&mut backend, &mut renderer);
    let scene = passes(&commands)[0];
    let start = scene
        .iter()
        .position(|c| *c == RecordedCommand::SetPipeline(renderer.programs().asteroids.pipeline))
        .unwrap();
    let groups: Vec<_> = scene[start..]
        .iter()
        .take_while(|c| !matches!(c, RecordedCommand::DrawIndexed { .. }))
        .filter_map(|c| match c {
            RecordedCommand::SetBindGroup { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(groups, vec![0, 1, 2]);

    renderer.destroy(&mut backend);
}

#[test]
fn planet_meshes_each_bind_a_material() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let mut renderer = renderer(&mut backend, SceneSpec::default(), 4);
    let commands = record_frame(&mut backend, &mut renderer);
    let scene = passes(&commands)[0];

    let planet_pipeline = renderer.programs().planet.pipeline;
    let start = scene
        .iter()
        .position(|c| *c == RecordedCommand::SetPipeline(planet_pipeline))
        .unwrap();
    let end = scene[start + 1..]
        .iter()
        .position(|c| matches!(c, RecordedCommand::SetPipeline(_)))
        .map_or(scene.len(), |i| start + 1 + i);
    let planet = &scene[start..end];

    let materials: Vec<_> = planet
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::SetBindGroup { index: 2, bind_group } => Some(*bind_group),
            _ => None,
        })
        .collect();
    let draws = planet
        .iter()
        .filter(|c| matches!(c, RecordedCommand::DrawIndexed { instances, .. } if *instances == (0..1)))
        .count();
    assert_eq!(draws, 2);
    assert_eq!(materials.len(), 2);
    assert_ne!(materials[0], materials[1]);
}

#[test]
fn skybox_is_the_last_scene_draw() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let mut renderer = renderer(&mut backend, SceneSpec::default(), 4);
    let commands = record_frame(&mut backend, &mut renderer);
    let scene = passes(&commands)[0];

    let last_draw = scene
        .iter()
        .rev()
        .find(|c| matches!(c, RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }))
        .unwrap();
    assert_eq!(
        last_draw,
        &RecordedCommand::Draw {
            vertices: 0..36,
            instances: 0..1,
        }
    );
    let skybox_pipeline = RecordedCommand::SetPipeline(renderer.programs().skybox.pipeline);
    assert!(scene.contains(&skybox_pipeline));
}

#[test]
fn teardown_releases_every_object_once() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let mut renderer = renderer(&mut backend, SceneSpec::default(), 8);
    record_frame(&mut backend, &mut renderer);
    assert!(backend.live_count(ResourceKind::RenderPipeline) == 4);

    renderer.destroy(&mut backend);
    assert!(backend.live_resources().is_empty(), "leaked: {:?}", backend.live_resources());
    assert!(backend.double_destroys().is_empty());
}

#[test]
fn resize_reallocates_target_and_rebinds_composite() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let mut renderer = renderer(&mut backend, SceneSpec::default(), 4);
    let old_resolve = renderer.target().resolve_view().unwrap();
    let live_before = backend.live_resources().len();

    backend.resize(640, 360);
    renderer.resize(&mut backend, 640, 360).unwrap();
    assert_eq!(renderer.target().size(), Some((640, 360)));
    assert_eq!(renderer.target().sample_count(), Some(4));
    let new_resolve = renderer.target().resolve_view().unwrap();
    assert_ne!(old_resolve, new_resolve);
    assert_eq!(backend.live_resources().len(), live_before);

    let commands = record_frame(&mut backend, &mut renderer);
    assert!(commands.contains(&RecordedCommand::SetViewport {
        width: 640.0,
        height: 360.0,
    }));

    renderer.destroy(&mut backend);
    assert!(backend.live_resources().is_empty());
    assert!(backend.double_destroys().is_empty());
}

#[test]
fn zero_sized_resize_keeps_the_target() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let mut renderer = renderer(&mut backend, SceneSpec::default(), 4);
    renderer.resize(&mut backend, 0, 0).unwrap();
    assert_eq!(renderer.target().state(), TargetState::Ready);
    assert_eq!(renderer.target().size(), Some((WIDTH, HEIGHT)));
    renderer.destroy(&mut backend);
}

#[test]
fn failed_construction_leaks_nothing() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let scene = build_scene(&mut backend, SceneSpec::default());
    let result = FrameRenderer::new(
        &mut backend,
        scene,
        Path::new("no/such/shaders"),
        4,
        FrameParams::default(),
    );
    assert!(matches!(result, Err(RenderError::ShaderCompileFailure { .. })));
    assert!(backend.live_resources().is_empty(), "leaked: {:?}", backend.live_resources());
}

#[test]
fn missing_assets_degrade_to_an_empty_scene_with_a_skybox() {
    let mut backend = RecordingBackend::new(WIDTH, HEIGHT);
    let config = AppConfig::default()
        .with_asset_root("does/not/exist")
        .with_asteroid_count(16)
        .with_seed(1);
    let scene = load_scene(&mut backend, &config, MemorySource::default).unwrap();
    assert!(scene.planet.is_empty());
    assert!(scene.asteroids.model().is_empty());
    assert_eq!(scene.asteroids.instance_count(), 16);
    assert_eq!(scene.skybox.placeholder_faces.len(), 6);

    let mut renderer =
        FrameRenderer::new(&mut backend, scene, &shader_dir(), 4, FrameParams::default()).unwrap();
    let commands = record_frame(&mut backend, &mut renderer);
    let scene = passes(&commands)[0];
    assert!(!scene.iter().any(|c| matches!(c, RecordedCommand::DrawIndexed { .. })));
    assert!(scene.contains(&RecordedCommand::Draw {
        vertices: 0..36,
        instances: 0..1,
    }));

    renderer.destroy(&mut backend);
    assert!(backend.live_resources().is_empty());
}
