//! End-to-end container lifecycle against the mock supervisor, with the
//! OCI hooks running in-process against a mock CNI.

use berth_core::hook::{handle, HookEnv, HookEvent};
use berth_core::logs::LogOptions;
use berth_core::{Engine, EngineOptions};
use berth_runtime::mock::HookMode;
use berth_runtime::{MockCni, MockSupervisor, State, Supervisor};
use berth_schema::config::HostFacts;
use berth_schema::{BerthConfig, RunOptions};
use berth_store::LifecycleStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _dir: tempfile::TempDir,
    engine: Engine,
    sup: Arc<MockSupervisor>,
    cni: Arc<MockCni>,
}

fn harness_with(cni: MockCni) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let netconf = dir.path().join("net.d");
    let cni = Arc::new(cni);

    let hook_cni = Arc::clone(&cni);
    let (hook_root, hook_netconf) = (root.clone(), netconf.clone());
    let callback = move |event: &str, state: &State| {
        let env = HookEnv::new(&hook_root, &hook_netconf, hook_cni.as_ref());
        let event: HookEvent = event.parse().map_err(|e| format!("{e}"))?;
        handle(event, state, &env).map_err(|e| e.to_string())
    };
    let sup = Arc::new(MockSupervisor::new().with_hooks(HookMode::Callback(Arc::new(callback))));

    let mut config = BerthConfig::defaults(&HostFacts::default());
    config.data_root = root;
    config.cni_netconfpath = netconf;
    let mut opts = EngineOptions::new(config);
    opts.proc_root = dir.path().join("proc");
    opts.host_resolv_conf = dir.path().join("resolv.conf");
    let engine = Engine::with_supervisor(opts, Arc::clone(&sup) as Arc<dyn Supervisor>);
    Harness {
        _dir: dir,
        engine,
        sup,
        cni,
    }
}

fn harness() -> Harness {
    harness_with(MockCni::new())
}

fn detached(name: &str) -> RunOptions {
    RunOptions {
        image: "alpine".to_owned(),
        name: Some(name.to_owned()),
        detach: true,
        ..RunOptions::default()
    }
}

fn lifecycle(h: &Harness, id: &str) -> LifecycleStore {
    LifecycleStore::new(h.engine.state_dir(id))
}

fn hosts_file(h: &Harness, id: &str) -> String {
    let path: PathBuf = h.engine.hosts().hosts_path(id).unwrap();
    std::fs::read_to_string(path).unwrap()
}

#[test]
fn run_attaches_and_stop_detaches() {
    let h = harness();
    let id = h.engine.run(&detached("web")).unwrap().id().to_owned();

    assert_eq!(h.cni.calls(), vec![format!("remove:bridge:{id}"), format!("setup:bridge:{id}")]);
    let st = lifecycle(&h, &id).load().unwrap();
    assert!(!st.create_error);
    assert!(st.started_at.is_some());
    assert!(hosts_file(&h, &id).contains("10.4.0.2"));
    assert_eq!(h.engine.names().get("web").unwrap().as_deref(), Some(id.as_str()));

    h.engine.stop("web", Some(Duration::from_secs(1))).unwrap();
    assert_eq!(h.cni.calls().last().unwrap(), &format!("remove:bridge:{id}"));
    assert!(h.engine.names().get("web").unwrap().is_none());
    assert_eq!(h.engine.ps(true).unwrap()[0].status, "exited");

    h.engine.start("web", false).unwrap();
    assert_eq!(h.engine.names().get("web").unwrap().as_deref(), Some(id.as_str()));
    assert_eq!(h.engine.ps(false).unwrap().len(), 1);
}

#[test]
fn failed_network_setup_leaves_nothing_behind() {
    let h = harness();
    h.cni.fail_next_setup("bridge: failed to allocate");
    let err = h.engine.run(&detached("web")).unwrap_err();
    assert!(err.to_string().contains("failed to allocate"), "{err}");

    assert!(h.engine.containers().unwrap().is_empty());
    assert!(h.engine.names().get("web").unwrap().is_none());
    // The name is free again.
    h.engine.run(&detached("web")).unwrap();
}

#[test]
fn two_containers_share_hosts_entries() {
    let h = harness();
    let a = h.engine.run(&detached("a")).unwrap().id().to_owned();
    let b = h.engine.run(&detached("b")).unwrap().id().to_owned();
    let hosts_a = hosts_file(&h, &a);
    assert!(hosts_a.contains("10.4.0.3"), "{hosts_a}");
    assert!(hosts_a.contains(" b"), "{hosts_a}");

    h.engine.remove("b", true, false).unwrap();
    let hosts_a = hosts_file(&h, &a);
    assert!(!hosts_a.contains("10.4.0.3"), "{hosts_a}");
    assert!(h.engine.hosts().hosts_path(&b).map(|p| !p.exists()).unwrap_or(true));
}

#[test]
fn remove_after_task_is_gone_releases_name_once() {
    let h = harness();
    let id = h.engine.run(&detached("web")).unwrap().id().to_owned();
    h.sup.kill_task(&id, 9).unwrap();
    h.sup.delete_task(&id, true).unwrap();
    assert!(h.engine.names().get("web").unwrap().is_none());

    assert_eq!(h.engine.remove("web", false, false).unwrap(), id);
    assert!(h.engine.containers().unwrap().is_empty());
    assert!(!h.engine.state_dir(&id).exists());
    assert!(h.engine.remove("web", false, false).unwrap_err().is_not_found());
}

#[test]
fn concurrent_runs_serialize_network_setup() {
    let h = harness_with(MockCni::new().with_delay(Duration::from_millis(30)));
    std::thread::scope(|s| {
        for i in 0..4 {
            let engine = &h.engine;
            s.spawn(move || engine.run(&detached(&format!("c{i}"))).unwrap());
        }
    });
    assert!(!h.cni.overlapped());
    assert_eq!(h.engine.ps(false).unwrap().len(), 4);
    let setups = h.cni.calls().iter().filter(|c| c.starts_with("setup:")).count();
    assert_eq!(setups, 4);
}

#[test]
fn json_file_logs_are_readable() {
    let h = harness();
    let id = h.engine.run(&detached("web")).unwrap().id().to_owned();
    let log: &Path = &h.engine.state_dir(&id).join(format!("{id}-json.log"));
    berth_core::logs::run_json_logger(log, "stdout", "ready\n".as_bytes()).unwrap();
    let mut seen = Vec::new();
    h.engine
        .logs("web", LogOptions::default(), &mut |e| {
            seen.push(e.log.clone());
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, vec!["ready\n"]);
}
