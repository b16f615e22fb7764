//! Mesh convergence tests over a simulated network.
//!
//! Every coordinator shares one virtual clock. Dials complete instantly when
//! the target exists and fail otherwise; messages are delivered in FIFO
//! order. The simulation only executes link actions, so these tests exercise
//! membership, gossip and failure handling, not cryptography.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use meshframe_core::{
    ConnectionError, LinkId, LocalPeer, MeshAction, MeshConfig, MeshCoordinator, MeshEvent,
    env::test_utils::MockEnv,
};
use meshframe_proto::PresenceStatus;

struct SimMesh {
    env: MockEnv,
    nodes: BTreeMap<String, MeshCoordinator<MockEnv>>,
    /// (node, link) → (remote node, remote link)
    links: HashMap<(String, LinkId), (String, LinkId)>,
    queue: VecDeque<(String, MeshEvent)>,
    log: Vec<(String, MeshAction)>,
}

impl SimMesh {
    fn new(seed: u64) -> Self {
        Self {
            env: MockEnv::with_seed(seed),
            nodes: BTreeMap::new(),
            links: HashMap::new(),
            queue: VecDeque::new(),
            log: Vec::new(),
        }
    }

    fn join(&mut self, id: &str, anchor: Option<&str>) {
        let local = LocalPeer {
            peer_id: id.to_string(),
            name: id.to_uppercase(),
            device_id: format!("{id}-device"),
            user_id: format!("{id}-user"),
        };
        let mesh = MeshCoordinator::new(
            self.env.clone(),
            local,
            anchor.map(str::to_string),
            MeshConfig::default(),
        );
        self.nodes.insert(id.to_string(), mesh);
        self.queue.push_back((id.to_string(), MeshEvent::Start));
        self.run();
    }

    /// Remove a node; every link to it closes.
    fn leave(&mut self, id: &str) {
        self.nodes.remove(id);
        let dangling: Vec<_> = self
            .links
            .iter()
            .filter(|((node, _), _)| node == id)
            .map(|(local, remote)| (local.clone(), remote.clone()))
            .collect();
        for (local, (remote, remote_link)) in dangling {
            self.links.remove(&local);
            self.links.remove(&(remote.clone(), remote_link));
            self.queue.push_back((
                remote,
                MeshEvent::ConnectionClosed { peer_id: id.to_string(), link: remote_link },
            ));
        }
        self.run();
    }

    /// `node` sees its link to `peer` close; `peer` keeps its half open.
    fn drop_one_side(&mut self, node: &str, peer: &str) {
        let link = self.nodes[node].connection(peer).map(|c| c.link()).unwrap();
        self.links.remove(&(node.to_string(), link));
        self.queue.push_back((
            node.to_string(),
            MeshEvent::ConnectionClosed { peer_id: peer.to_string(), link },
        ));
        self.run();
    }

    fn tick(&mut self, seconds: u64) {
        for _ in 0..seconds {
            self.env.advance(Duration::from_secs(1));
            for id in self.nodes.keys() {
                self.queue.push_back((id.clone(), MeshEvent::Tick));
            }
            self.run();
        }
    }

    fn run(&mut self) {
        while let Some((node, event)) = self.queue.pop_front() {
            let Some(mesh) = self.nodes.get_mut(&node) else {
                continue;
            };
            for action in mesh.handle(event) {
                self.execute(&node, action);
            }
        }
    }

    fn execute(&mut self, from: &str, action: MeshAction) {
        match &action {
            MeshAction::Dial { peer_id, link, .. } => match self.nodes.get_mut(peer_id) {
                Some(target) => {
                    let remote_link = target.allocate_link();
                    self.links.insert((from.to_string(), *link), (peer_id.clone(), remote_link));
                    self.links.insert((peer_id.clone(), remote_link), (from.to_string(), *link));
                    self.queue.push_back((
                        from.to_string(),
                        MeshEvent::ConnectionOpened { peer_id: peer_id.clone(), link: *link },
                    ));
                    self.queue.push_back((
                        peer_id.clone(),
                        MeshEvent::IncomingConnection {
                            peer_id: from.to_string(),
                            link: remote_link,
                        },
                    ));
                },
                None => self.queue.push_back((
                    from.to_string(),
                    MeshEvent::ConnectionFailed {
                        peer_id: peer_id.clone(),
                        link: *link,
                        error: ConnectionError::Transport("unreachable".to_string()),
                    },
                )),
            },
            MeshAction::Send { peer_id, message } => {
                let link = self.nodes[from].connection(peer_id).map(|c| c.link());
                if let Some((remote, remote_link)) =
                    link.and_then(|l| self.links.get(&(from.to_string(), l)))
                {
                    self.queue.push_back((
                        remote.clone(),
                        MeshEvent::ControlReceived {
                            peer_id: from.to_string(),
                            link: *remote_link,
                            message: message.clone(),
                        },
                    ));
                }
            },
            MeshAction::CloseLink { link, .. } => {
                if let Some((remote, remote_link)) = self.links.remove(&(from.to_string(), *link))
                {
                    self.links.remove(&(remote.clone(), remote_link));
                    let peer_id = from.to_string();
                    let closed = MeshEvent::ConnectionClosed { peer_id, link: remote_link };
                    self.queue.push_back((remote, closed));
                }
            },
            _ => {},
        }
        self.log.push((from.to_string(), action));
    }

    /// Panics unless every pair of nodes shares exactly one open link.
    fn assert_full_mesh(&self) {
        for (a, mesh_a) in &self.nodes {
            for b in self.nodes.keys().filter(|b| *b != a) {
                let conn = mesh_a
                    .connection(b)
                    .unwrap_or_else(|| panic!("{a} has no link to {b}"));
                assert!(conn.is_open(), "{a} -> {b} not open");

                let remote = self.links.get(&(a.clone(), conn.link()));
                let back = self.nodes[b].connection(a).map(|c| c.link());
                assert_eq!(remote, back.map(|l| (b.clone(), l)).as_ref(), "{a} <-> {b} disagree");
                assert!(mesh_a.roster().get(b).is_some(), "{a} has no roster entry for {b}");
            }
        }
    }

    fn count(&self, node: &str, pred: impl Fn(&MeshAction) -> bool) -> usize {
        self.log.iter().filter(|(n, a)| n == node && pred(a)).count()
    }
}

#[test]
fn peers_joining_via_anchor_form_full_mesh() {
    let mut sim = SimMesh::new(1);
    sim.join("peer-0", None);
    for i in 1..=4 {
        sim.join(&format!("peer-{i}"), Some("peer-0"));
    }

    sim.assert_full_mesh();

    // One session establishment per hello received, in each direction
    for id in sim.nodes.keys() {
        let established = sim.count(id, |a| matches!(a, MeshAction::EstablishSession { .. }));
        assert!(established >= 4, "{id} established {established} sessions");
    }
}

#[test]
fn mesh_stays_healthy_under_heartbeats() {
    let mut sim = SimMesh::new(2);
    sim.join("peer-0", None);
    sim.join("peer-1", Some("peer-0"));
    sim.join("peer-2", Some("peer-0"));

    sim.tick(30);

    sim.assert_full_mesh();
    for mesh in sim.nodes.values() {
        for member in mesh.roster().iter() {
            assert_eq!(member.status, PresenceStatus::Online);
        }
        for peer in mesh.connected_peers() {
            assert!(mesh.connection(&peer).unwrap().metrics().last_rtt_ms().is_some());
        }
    }
    assert!(sim.log.iter().all(|(_, a)| !matches!(a, MeshAction::Failed { .. })));
}

#[test]
fn departed_anchor_reported_failed_exactly_once() {
    let mut sim = SimMesh::new(3);
    sim.join("peer-0", None);
    sim.join("peer-1", Some("peer-0"));
    sim.join("peer-2", Some("peer-0"));

    sim.leave("peer-0");
    sim.tick(120);

    for id in ["peer-1", "peer-2"] {
        let failures = sim.count(id, |a| {
            matches!(a, MeshAction::Failed { peer_id, .. } if peer_id == "peer-0")
        });
        assert_eq!(failures, 1, "{id} reported anchor failure {failures} times");

        let mesh = &sim.nodes[id];
        assert!(mesh.is_failed("peer-0"));
        assert_eq!(mesh.roster().get("peer-0").unwrap().status, PresenceStatus::Offline);
    }

    // The survivors keep their direct link
    sim.assert_full_mesh();
}

#[test]
fn departed_peer_is_redialed_by_tie_break_winner_only() {
    let mut sim = SimMesh::new(4);
    sim.join("peer-0", None);
    sim.join("peer-1", Some("peer-0"));
    sim.join("peer-2", Some("peer-0"));

    sim.leave("peer-1");
    sim.tick(60);

    // peer-2 > peer-1: peer-2 retries and eventually gives up
    let dials_2 = sim.count("peer-2", |a| {
        matches!(a, MeshAction::Dial { peer_id, .. } if peer_id == "peer-1")
    });
    assert!(dials_2 > 1);
    assert!(sim.nodes["peer-2"].is_failed("peer-1"));

    // peer-0 < peer-1: peer-0 never redials after the close
    let before = sim.log.len();
    sim.tick(10);
    let redials_0 = sim.log[before..]
        .iter()
        .filter(|(n, a)| {
            n == "peer-0" && matches!(a, MeshAction::Dial { peer_id, .. } if peer_id == "peer-1")
        })
        .count();
    assert_eq!(redials_0, 0);
    assert!(!sim.nodes["peer-0"].is_failed("peer-1"));
}

#[test]
fn rejoining_device_replaces_old_connection_everywhere() {
    let mut sim = SimMesh::new(5);
    sim.join("peer-0", None);
    sim.join("peer-1", Some("peer-0"));
    sim.join("peer-2", Some("peer-0"));

    // Same device comes back under a new connection id before the old links
    // are noticed as closed.
    let old_links: Vec<_> = sim.links.keys().filter(|(n, _)| n == "peer-1").cloned().collect();
    sim.nodes.remove("peer-1");
    for key in old_links {
        sim.links.remove(&key);
    }

    let local = LocalPeer {
        peer_id: "peer-1b".to_string(),
        name: "PEER-1".to_string(),
        device_id: "peer-1-device".to_string(),
        user_id: "peer-1-user".to_string(),
    };
    let mesh = MeshCoordinator::new(
        sim.env.clone(),
        local,
        Some("peer-0".to_string()),
        MeshConfig::default(),
    );
    sim.nodes.insert("peer-1b".to_string(), mesh);
    sim.queue.push_back(("peer-1b".to_string(), MeshEvent::Start));
    sim.run();

    for id in ["peer-0", "peer-2"] {
        let mesh = &sim.nodes[id];
        assert!(mesh.roster().get("peer-1").is_none(), "{id} kept stale entry");
        assert!(mesh.roster().get("peer-1b").is_some());
        assert!(mesh.connection("peer-1").is_none());
    }
    sim.assert_full_mesh();
}

#[test]
fn redial_over_half_open_link_renews_sessions_on_both_ends() {
    let mut sim = SimMesh::new(6);
    sim.join("peer-0", None);
    sim.join("peer-1", Some("peer-0"));

    let before = sim.log.len();
    sim.drop_one_side("peer-1", "peer-0");
    assert!(sim.nodes["peer-0"].connection("peer-1").unwrap().is_open());

    // peer-1 retries its anchor; peer-0 takes the new link over the old one
    sim.tick(5);
    sim.assert_full_mesh();

    let session_actions = |node: &str, peer: &str| -> Vec<&'static str> {
        sim.log[before..]
            .iter()
            .filter(|(n, _)| n == node)
            .filter_map(|(_, action)| match action {
                MeshAction::DropSession { peer_id } if peer_id == peer => Some("drop"),
                MeshAction::EstablishSession { peer_id, .. } if peer_id == peer => {
                    Some("establish")
                },
                _ => None,
            })
            .collect()
    };
    assert_eq!(session_actions("peer-0", "peer-1"), vec!["drop", "establish"]);
    assert_eq!(session_actions("peer-1", "peer-0"), vec!["drop", "establish"]);
}
