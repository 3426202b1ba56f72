//! Core lifecycle tests: run uniqueness, fail-fast prepare/start and the
//! stop sweep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use interpose_core::{Core, CoreError, CoreHandle, CoreListener, CoreModules, CoreState, ModuleSpec};
use interpose_testing::{
    fixture_registry, init_tracing, within, ScriptedInterceptorFactory, TestProxyFactory, Trace,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Hooks(Mutex<Vec<&'static str>>);

impl Hooks {
    fn seen(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, hook: &'static str) {
        self.0.lock().unwrap().push(hook);
    }
}

impl CoreListener for Hooks {
    fn before_prepare(&self, _core: &CoreHandle) {
        self.push("before_prepare");
    }
    fn after_prepare(&self, _core: &CoreHandle) {
        self.push("after_prepare");
    }
    fn before_start(&self, _core: &CoreHandle) {
        self.push("before_start");
    }
    fn after_start(&self, _core: &CoreHandle) {
        self.push("after_start");
    }
    fn before_stop(&self, _core: &CoreHandle) {
        self.push("before_stop");
    }
    fn after_stop(&self, _core: &CoreHandle) {
        self.push("after_stop");
    }
}

fn core_with(trace: &Trace, modules: CoreModules) -> (Core, Arc<TestProxyFactory>, Arc<Hooks>) {
    init_tracing();
    let (registry, _, proxies) = fixture_registry(trace);
    let core = Core::new(registry, modules);
    let hooks = Arc::new(Hooks::default());
    core.register_listener(hooks.clone());
    (core, proxies, hooks)
}

async fn run_until_stopped(core: &Core) {
    within(TIMEOUT, core.wait_for_state(CoreState::Stopped)).await;
}

#[tokio::test]
async fn test_full_lifecycle_runs_every_hook_in_order() {
    let trace = Trace::new();
    let modules = CoreModules {
        proxies: vec![TestProxyFactory::module("p1")],
        interceptors_c2s: vec![ScriptedInterceptorFactory::module("c2s", json!({"behavior": "record"}))],
        interceptors_s2c: vec![ScriptedInterceptorFactory::module("s2c", json!({"behavior": "record"}))],
    };
    let (core, _, hooks) = core_with(&trace, modules);

    assert!(core.start());
    within(TIMEOUT, core.wait_for_state(CoreState::Started)).await;
    assert!(core.stop());
    run_until_stopped(&core).await;

    assert_eq!(
        hooks.seen(),
        vec![
            "before_prepare",
            "after_prepare",
            "before_start",
            "after_start",
            "before_stop",
            "after_stop",
        ]
    );
    assert_eq!(trace.phases("p1"), vec!["prepare", "start", "stop"]);
    assert_eq!(trace.phases("c2s"), vec!["prepare", "stop"]);
    assert_eq!(trace.phases("s2c"), vec!["prepare", "stop"]);
}

#[tokio::test]
async fn test_start_twice_leaves_one_run() {
    let trace = Trace::new();
    let modules = CoreModules {
        proxies: vec![TestProxyFactory::module("p1")],
        ..Default::default()
    };
    let (core, _, _) = core_with(&trace, modules);

    assert!(core.start());
    assert!(!core.start());
    within(TIMEOUT, core.wait_for_state(CoreState::Started)).await;
    assert!(!core.start());

    assert_eq!(trace.phases("p1"), vec!["prepare", "start"]);

    assert!(core.stop());
    run_until_stopped(&core).await;
    assert_eq!(trace.phases("p1"), vec!["prepare", "start", "stop"]);
}

#[tokio::test]
async fn test_stop_on_stopped_core_is_noop() {
    let trace = Trace::new();
    let (core, _, hooks) = core_with(&trace, CoreModules::default());
    let states = core.subscribe();

    assert!(!core.stop());
    assert_eq!(core.state(), CoreState::Stopped);
    assert!(!states.has_changed().unwrap());
    assert!(hooks.seen().is_empty());
}

#[tokio::test]
async fn test_failed_interceptor_prepare_never_starts_proxies() {
    let trace = Trace::new();
    let modules = CoreModules {
        proxies: vec![TestProxyFactory::module("p1")],
        interceptors_c2s: vec![ScriptedInterceptorFactory::module(
            "broken",
            json!({"behavior": "fail-prepare"}),
        )],
        interceptors_s2c: vec![ScriptedInterceptorFactory::module("s2c", json!({"behavior": "record"}))],
    };
    let (core, proxies, hooks) = core_with(&trace, modules);
    let mut states = core.subscribe();

    assert!(core.start());
    let mut seen = vec![*states.borrow_and_update()];
    while *seen.last().unwrap() != CoreState::Stopped {
        within(TIMEOUT, states.changed()).await.unwrap();
        seen.push(*states.borrow_and_update());
    }

    assert!(!seen.contains(&CoreState::Prepared));
    assert!(!seen.contains(&CoreState::Started));
    assert_eq!(trace.phases("p1"), vec!["prepare", "stop"]);
    // S2C chain is never prepared after the C2S failure, but the sweep still stops it.
    assert_eq!(trace.phases("s2c"), vec!["stop"]);
    assert!(!proxies.proxy("p1").unwrap().is_running());
    assert_eq!(hooks.seen(), vec!["before_prepare", "before_stop", "after_stop"]);
}

#[tokio::test]
async fn test_failed_proxy_start_sweeps_started_proxies() {
    let trace = Trace::new();
    let modules = CoreModules {
        proxies: vec![
            TestProxyFactory::module("first"),
            TestProxyFactory::module("second").with_config(json!({"fail_start": true})),
            TestProxyFactory::module("third"),
        ],
        ..Default::default()
    };
    let (core, proxies, _) = core_with(&trace, modules);

    assert!(core.start());
    run_until_stopped(&core).await;

    assert_eq!(trace.phases("first"), vec!["prepare", "start", "stop"]);
    assert_eq!(trace.phases("second"), vec!["prepare", "start", "stop"]);
    assert_eq!(trace.phases("third"), vec!["prepare", "stop"]);
    assert!(!proxies.proxy("first").unwrap().is_running());
}

#[tokio::test]
async fn test_disabled_modules_are_never_built() {
    let trace = Trace::new();
    let modules = CoreModules {
        proxies: vec![
            TestProxyFactory::module("on"),
            TestProxyFactory::module("off").disabled(),
        ],
        interceptors_c2s: vec![
            ScriptedInterceptorFactory::module("skipped", json!({"behavior": "record"})).disabled(),
            ScriptedInterceptorFactory::module("kept", json!({"behavior": "record"})),
        ],
        ..Default::default()
    };
    let (core, proxies, _) = core_with(&trace, modules);

    assert!(core.start());
    within(TIMEOUT, core.wait_for_state(CoreState::Started)).await;

    let handle = core.handle();
    assert!(proxies.proxy("off").is_none());
    assert_eq!(handle.proxies().unwrap().len(), 1);
    let chain = handle.interceptors_c2s().unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].code(), "kept");
    assert_eq!(chain[0].id(), 0);

    core.stop();
    run_until_stopped(&core).await;
}

#[tokio::test]
async fn test_unknown_factory_aborts_run() {
    let trace = Trace::new();
    let modules = CoreModules {
        proxies: vec![ModuleSpec::new("p1", "no-such-factory")],
        ..Default::default()
    };
    let (core, _, hooks) = core_with(&trace, modules);

    assert!(core.start());
    run_until_stopped(&core).await;

    assert_eq!(hooks.seen(), vec!["before_prepare", "before_stop", "after_stop"]);
}

#[tokio::test]
async fn test_handle_goes_inactive_after_stop_and_core_restarts() {
    let trace = Trace::new();
    let modules = CoreModules {
        proxies: vec![TestProxyFactory::module("p1")],
        ..Default::default()
    };
    let (core, _, _) = core_with(&trace, modules);

    assert!(core.start());
    within(TIMEOUT, core.wait_for_state(CoreState::Started)).await;
    let handle = core.handle();
    assert_eq!(handle.state(), CoreState::Started);
    assert!(handle.proxy("p1").unwrap().is_some());

    core.stop();
    run_until_stopped(&core).await;
    assert!(matches!(handle.proxies(), Err(CoreError::Inactive)));
    assert_eq!(handle.state(), CoreState::Stopped);

    assert!(core.start());
    within(TIMEOUT, core.wait_for_state(CoreState::Started)).await;
    assert!(core.handle().proxy("p1").unwrap().is_some());
    assert!(matches!(handle.proxies(), Err(CoreError::Inactive)));

    core.stop();
    run_until_stopped(&core).await;
    assert_eq!(trace.phases("p1"), vec!["prepare", "start", "stop", "prepare", "start", "stop"]);
}
