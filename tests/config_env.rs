use serial_test::serial;
use star_forest::prelude::*;

const KEYS: [&str; 7] = [
    "SF_BACKEND",
    "SF_RANK_ORDER",
    "SF_ALLOW_MULTI_LEAVES",
    "SF_MONITOR",
    "SF_GPU_AWARE",
    "SF_PARALLEL_UNPACK_THRESHOLD",
    "SF_BASE_TAG",
];

fn clear_env() {
    for key in KEYS {
        // SAFETY: every test touching the environment runs under #[serial].
        unsafe { std::env::remove_var(key) };
    }
}

fn set(key: &str, value: &str) {
    // SAFETY: see `clear_env`.
    unsafe { std::env::set_var(key, value) };
}

#[test]
#[serial]
fn empty_environment_gives_defaults() {
    clear_env();
    assert_eq!(SfConfig::from_env().unwrap(), SfConfig::default());
}

#[test]
#[serial]
fn variables_override_defaults() {
    clear_env();
    set("SF_BACKEND", "window");
    set("SF_RANK_ORDER", "yes");
    set("SF_MONITOR", "1");
    set("SF_PARALLEL_UNPACK_THRESHOLD", "64");
    set("SF_BASE_TAG", "512");
    let cfg = SfConfig::from_env().unwrap();
    clear_env();
    assert_eq!(cfg.backend, SfBackend::Window);
    assert!(cfg.rank_order);
    assert!(cfg.monitor);
    assert!(!cfg.use_gpu_aware);
    assert_eq!(cfg.parallel_unpack_threshold, 64);
    assert_eq!(cfg.base_tag, 512);
}

#[test]
#[serial]
fn malformed_values_are_configuration_errors() {
    clear_env();
    set("SF_GPU_AWARE", "maybe");
    let err = SfContext::from_env().unwrap_err();
    clear_env();
    assert!(matches!(err, SfError::Config(ref m) if m.contains("SF_GPU_AWARE")));
    assert!(err.is_configuration());
}

#[test]
#[serial]
fn context_from_env_configures_new_star_forests() {
    clear_env();
    set("SF_ALLOW_MULTI_LEAVES", "true");
    let ctx = SfContext::from_env().unwrap();
    clear_env();
    let mut sf = StarForest::new(&ctx, &NoComm).unwrap();
    assert!(sf.config().allow_multi_leaves);
    // two leaves share slot 0; the values are combined there
    sf.set_graph(2, 2, Some(vec![0, 0].into()), vec![SfNode::new(0, 0), SfNode::new(0, 1)])
        .unwrap();
    let mut leaf = [0i32];
    sf.bcast(Unit::scalar(), &[3, 4], &mut leaf, ReduceOp::Sum).unwrap();
    assert_eq!(leaf, [7]);
}

#[test]
#[serial]
fn monitored_operations_log_and_complete() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = SfConfig {
        monitor: true,
        ..SfConfig::default()
    };
    let out = ThreadWorld::run(2, |comm| {
        let ctx = SfContext::initialize(config.clone());
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        sf.set_graph(1, 1, None, vec![SfNode::new(1 - comm.rank(), 0)])
            .unwrap();
        let mut leaf = [0u16];
        sf.bcast(Unit::scalar(), &[comm.rank() as u16], &mut leaf, ReduceOp::Replace)
            .unwrap();
        leaf[0]
    });
    assert_eq!(out, vec![1, 0]);
}
