//! Hosts-store invariants over long operation sequences.

use berth_schema::cni::{CniIpConfig, CniResult};
use berth_schema::DEFAULT_NETWORK_NAME;
use berth_store::hosts::{NetworkMeta, MARKER_BEGIN, MARKER_END};
use berth_store::HostsStore;
use std::collections::BTreeMap;

const NETWORKS: &[&str] = &[DEFAULT_NETWORK_NAME, "n1", "n2", "n3"];

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn make_meta(idx: usize, rng: &mut Lcg) -> NetworkMeta {
    let mut networks = BTreeMap::new();
    for (n, net) in NETWORKS.iter().enumerate() {
        if rng.below(2) == 0 {
            networks.insert(
                (*net).to_owned(),
                CniResult {
                    cni_version: "1.0.0".to_owned(),
                    ips: vec![CniIpConfig {
                        interface: Some(1),
                        address: format!("10.{n}.0.{}/24", idx + 2),
                        gateway: None,
                    }],
                    ..CniResult::default()
                },
            );
        }
    }
    NetworkMeta {
        id: format!("ctr{idx}"),
        name: format!("name{idx}"),
        hostname: format!("host{idx}"),
        networks,
        ..NetworkMeta::default()
    }
}

fn managed_lines(content: &str) -> Vec<String> {
    let begin = content.find(MARKER_BEGIN).expect("begin marker");
    let end = content.find(MARKER_END).expect("end marker");
    content[begin..end]
        .lines()
        .skip(1)
        .map(str::to_owned)
        .collect()
}

fn check_consistency(store: &HostsStore, live: &BTreeMap<String, NetworkMeta>) {
    for b in live.values() {
        let content = std::fs::read_to_string(store.hosts_path(&b.id).unwrap()).unwrap();
        let lines = managed_lines(&content);
        for a in live.values() {
            for net in NETWORKS {
                let Some(result) = a.networks.get(*net) else {
                    continue;
                };
                let ip = result.ips[0].ip();
                let line = lines
                    .iter()
                    .find(|l| l.split_whitespace().next() == Some(ip));
                let shared = b.networks.contains_key(*net);
                assert_eq!(
                    line.is_some(),
                    shared,
                    "{}'s hosts vs {} on {net}:\n{content}",
                    b.id,
                    a.id
                );
                if let Some(line) = line {
                    let tokens: Vec<&str> = line.split_whitespace().skip(1).collect();
                    assert!(tokens.contains(&a.hostname.as_str()));
                    assert!(tokens.contains(&a.name.as_str()));
                    let suffixed = format!("{}.{net}", a.hostname);
                    assert_eq!(
                        tokens.contains(&suffixed.as_str()),
                        *net != DEFAULT_NETWORK_NAME
                    );
                }
            }
        }
    }
}

#[test]
fn peers_resolve_iff_they_share_a_network() {
    let dir = tempfile::tempdir().unwrap();
    let store = HostsStore::new(dir.path().join("etchosts/default"));
    let mut rng = Lcg(7);
    let mut live: BTreeMap<String, NetworkMeta> = BTreeMap::new();

    for step in 0..60 {
        let idx = rng.below(8) as usize;
        let id = format!("ctr{idx}");
        match rng.below(3) {
            0 => {
                let meta = make_meta(idx, &mut rng);
                store.acquire(&meta).unwrap();
                live.insert(id, meta);
            }
            1 => {
                store.release(&id).unwrap();
                live.remove(&id);
            }
            _ => {
                if let Some(meta) = live.get_mut(&id) {
                    meta.name = format!("renamed{idx}_{step}");
                    store.update(&id, &meta.name).unwrap();
                }
            }
        }
        check_consistency(&store, &live);
    }
}

#[test]
fn user_content_survives_regeneration() {
    let dir = tempfile::tempdir().unwrap();
    let store = HostsStore::new(dir.path().join("etchosts/default"));
    let user = "# added by user\n192.0.2.10 printer\n";
    store.alloc_hosts_file("ctr0", user.as_bytes()).unwrap();

    let mut rng = Lcg(11);
    let mine = make_meta(0, &mut rng);
    store.acquire(&mine).unwrap();
    for i in 1..6 {
        let peer = make_meta(i, &mut rng);
        store.acquire(&peer).unwrap();
        if i % 2 == 0 {
            store.release(&peer.id).unwrap();
        }
        let content = std::fs::read_to_string(store.hosts_path("ctr0").unwrap()).unwrap();
        assert!(content.starts_with(user), "{content}");
        assert_eq!(content.matches(MARKER_BEGIN).count(), 1);
    }
}
