use deferred_engine::pipeline::{
    GeometryExtractor, GeometryFrameData, MeshBinding, OrchestratorOptions, PipelineOrchestrator,
};
use deferred_engine::scene::{BoundingSphere, MeshRenderer, Scene, Transform};
use deferred_engine::{
    DummyBackend, ExtensionRegistry, FrameDriver, FrameState, GraphicsBackend, PassContext,
    RenderExtension, RenderGate, RenderResult, RenderTargetSet, RendererConfig, SharedTarget,
    SlotRegistry, TickDriver, World,
};
use glam::Vec3;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Shared fixture: scene + mesh arena + full render/simulation wiring
// ---------------------------------------------------------------------------

struct Fixture {
    driver: FrameDriver,
    tick: TickDriver,
    buffer: Arc<deferred_engine::TripleBuffer<FrameState>>,
    lights_run: Arc<AtomicU32>,
}

/// A minimal lighting extension drawing into the light accumulation buffer.
struct LightGather {
    runs: Arc<AtomicU32>,
}

impl RenderExtension for LightGather {
    fn name(&self) -> &str {
        "light_gather"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn render_second_pass_full(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        ctx.targets
            .bind(ctx.backend, SharedTarget::LightAccumulation, true);
        ctx.backend.end_render_pass();
        self.runs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn build_fixture(config: RendererConfig) -> Fixture {
    config.validate().unwrap();
    let mut backend = DummyBackend::with_size(config.width, config.height);

    // Startup-time slot registration, then seal by wrapping in Arc.
    let mut slots = SlotRegistry::new();
    let geometry_token = slots.register(GeometryFrameData::default);
    let slots = Arc::new(slots);
    let buffer = Arc::new(FrameState::allocate_buffered(Arc::clone(&slots)));
    let gate = Arc::new(RenderGate::new());

    // A tiny mesh arena: one shared vertex/index buffer pair.
    let arena_vertices = backend
        .create_buffer_init(
            &deferred_engine::backend::types::BufferDescriptor {
                label: Some("arena_vertices".to_string()),
                size: 48 * 24,
                usage: deferred_engine::backend::types::BufferUsage::VERTEX,
                mapped_at_creation: false,
            },
            &[0u8; 48 * 24],
        )
        .unwrap();
    let arena_indices = backend
        .create_buffer_init(
            &deferred_engine::backend::types::BufferDescriptor {
                label: Some("arena_indices".to_string()),
                size: 4 * 36,
                usage: deferred_engine::backend::types::BufferUsage::INDEX,
                mapped_at_creation: false,
            },
            &[0u8; 4 * 36],
        )
        .unwrap();

    let mut bindings = HashMap::new();
    bindings.insert(
        1u64,
        MeshBinding {
            vertex_buffer: arena_vertices,
            index_buffer: arena_indices,
            index_count: 36,
            first_index: 0,
            base_vertex: 0,
            arena_resident: true,
        },
    );

    // Scene content comes from an ECS world snapshot.
    let mut world = World::new();
    for x in 0..4 {
        world.spawn((
            Transform::from_position(Vec3::new(x as f32 * 2.0, 0.0, -5.0)),
            MeshRenderer::new(1, 1).with_bounds(BoundingSphere {
                center: Vec3::ZERO,
                radius: 1.0,
            }),
        ));
    }
    let scene = Arc::new(RwLock::new(Scene::new()));
    scene.write().sync_from_world(&mut world);

    let lights_run = Arc::new(AtomicU32::new(0));
    let extensions = ExtensionRegistry::builder()
        .add(LightGather {
            runs: Arc::clone(&lights_run),
        })
        .build();

    let targets = RenderTargetSet::new(&mut backend, config.width, config.height).unwrap();
    let orchestrator = PipelineOrchestrator::new(
        &mut backend,
        &targets,
        Arc::clone(&extensions),
        geometry_token,
        OrchestratorOptions {
            enable_indirect_rendering: config.enable_indirect_rendering,
            enable_post_processing: config.enable_post_processing,
            validate_driver_calls: config.validate_driver_calls,
            ..Default::default()
        },
    )
    .unwrap();

    let mut driver = FrameDriver::new(
        Box::new(backend),
        targets,
        Arc::clone(&buffer),
        Arc::clone(&gate),
        &config,
    );
    driver.add_system(Box::new(orchestrator));

    let mut tick = TickDriver::new(
        Arc::clone(&buffer),
        extensions,
        Arc::clone(&scene),
        gate,
        config.force_single_threaded,
    );
    tick.add_extractor(Box::new(GeometryExtractor::new(
        scene,
        Arc::new(bindings),
        geometry_token,
    )));

    Fixture {
        driver,
        tick,
        buffer,
        lights_run,
    }
}

fn dummy_commands(driver: &FrameDriver) -> Vec<String> {
    driver
        .backend()
        .as_any()
        .downcast_ref::<DummyBackend>()
        .unwrap()
        .commands()
        .to_vec()
}

// ---------------------------------------------------------------------------
// One tick, one frame: command stream shape
// ---------------------------------------------------------------------------

#[test]
fn single_frame_command_stream() {
    let mut fx = build_fixture(RendererConfig {
        width: 640,
        height: 360,
        ..Default::default()
    });

    fx.tick.tick(1.0 / 60.0).unwrap();
    fx.driver.run_frame();

    let commands = dummy_commands(&fx.driver);
    let pos = |needle: &str| {
        commands
            .iter()
            .position(|c| c.starts_with(needle))
            .unwrap_or_else(|| panic!("missing command: {needle}\n{commands:#?}"))
    };

    let begin = pos("begin_frame");
    let cull = pos("begin_compute_pass batch_cull");
    let geometry = pos("begin_render_pass geometry");
    let multi_draw = pos("multi_draw_indexed_indirect");
    let light = pos("begin_render_pass lightaccumulation");
    let combine = pos("begin_render_pass finalcolor");
    let present = pos("end_frame");
    let fence = pos("create_fence");

    // The macro-pipeline's fixed order.
    assert!(begin < cull);
    assert!(cull < geometry, "cull dispatch precedes the geometry pass");
    assert!(geometry < multi_draw);
    assert!(multi_draw < light);
    assert!(light < combine);
    assert!(combine < present);
    assert!(present < fence, "fence is created for the consumed frame");

    assert_eq!(fx.lights_run.load(Ordering::Relaxed), 1);
}

// ---------------------------------------------------------------------------
// Free-running threads: producer and consumer never deadlock
// ---------------------------------------------------------------------------

#[test]
fn two_threads_free_running() {
    let fx = build_fixture(RendererConfig {
        width: 320,
        height: 180,
        ..Default::default()
    });
    let Fixture {
        mut driver,
        mut tick,
        buffer,
        lights_run,
    } = fx;

    let done = Arc::new(AtomicBool::new(false));
    let sim_done = Arc::clone(&done);
    let sim = std::thread::spawn(move || {
        for _ in 0..200 {
            tick.tick(1.0 / 240.0).unwrap();
        }
        sim_done.store(true, Ordering::Release);
        tick
    });

    while !done.load(Ordering::Acquire) {
        driver.run_frame();
    }
    // One more frame to consume whatever was published last.
    driver.run_frame();

    let tick = sim.join().unwrap();
    assert_eq!(tick.published(), 200);
    assert!(driver.frames() >= 1);
    assert!(lights_run.load(Ordering::Relaxed) >= 1);

    // The consumer ends on the newest published cycle; intermediate frames
    // may have been dropped, never reordered.
    let read = buffer.acquire_read(|s, r| s.cycle() > r.cycle());
    assert_eq!(read.cycle(), 200);
}

// ---------------------------------------------------------------------------
// Forced single-threaded mode: strict tick/render lock-step
// ---------------------------------------------------------------------------

#[test]
fn forced_single_threaded_lock_step() {
    let fx = build_fixture(RendererConfig {
        width: 320,
        height: 180,
        force_single_threaded: true,
        ..Default::default()
    });
    let Fixture {
        mut driver,
        mut tick,
        buffer,
        ..
    } = fx;

    let done = Arc::new(AtomicBool::new(false));
    let sim_done = Arc::clone(&done);
    let sim = std::thread::spawn(move || {
        for _ in 0..50 {
            tick.tick(1.0 / 60.0).unwrap();
        }
        sim_done.store(true, Ordering::Release);
        tick
    });

    while !done.load(Ordering::Acquire) {
        driver.run_frame();
    }
    driver.run_frame();

    let tick = sim.join().unwrap();
    assert_eq!(tick.published(), 50);
    // Lock-step means a tick only proceeds once the prior frame rendered.
    assert!(driver.frames() >= 50);

    let read = buffer.acquire_read(|s, r| s.cycle() > r.cycle());
    assert_eq!(read.cycle(), 50);
}

// ---------------------------------------------------------------------------
// Indirect path disabled by configuration falls back to direct draws
// ---------------------------------------------------------------------------

#[test]
fn indirect_disabled_by_config_uses_direct_path() {
    let mut fx = build_fixture(RendererConfig {
        width: 320,
        height: 180,
        enable_indirect_rendering: false,
        ..Default::default()
    });

    fx.tick.tick(1.0 / 60.0).unwrap();
    fx.driver.run_frame();

    let commands = dummy_commands(&fx.driver);
    assert!(!commands.iter().any(|c| c.contains("multi_draw")));
    let direct = commands
        .iter()
        .filter(|c| c.starts_with("draw_indexed"))
        .count();
    assert_eq!(direct, 4, "all four scene objects draw directly");
}
