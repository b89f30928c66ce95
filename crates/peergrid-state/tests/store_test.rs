//! End-to-end scenarios against the public store surface.

use std::sync::mpsc::{channel, sync_channel};

use peergrid_state::{
    DirEntry, HealthCheck, Node, NodeService, Session, StateError, StateStore, TableId,
    HEALTH_CRITICAL, HEALTH_PASSING,
};

fn store() -> StateStore {
    StateStore::new_in_memory().unwrap()
}

fn register_web_on_n1(store: &StateStore) {
    store
        .ensure_node(
            1,
            &Node {
                node: "n1".to_string(),
                address: "10.0.0.1".to_string(),
            },
        )
        .unwrap();
    store
        .ensure_service(
            2,
            "n1",
            &NodeService {
                id: "web".to_string(),
                service: "web".to_string(),
                tags: vec![],
                port: 80,
            },
        )
        .unwrap();
    store
        .ensure_check(
            3,
            &HealthCheck {
                node: "n1".to_string(),
                check_id: "web-ping".to_string(),
                name: "web-ping".to_string(),
                status: HEALTH_PASSING.to_string(),
                service_id: "web".to_string(),
                ..HealthCheck::default()
            },
        )
        .unwrap();
}

#[test]
fn registration_is_visible_through_the_health_join() {
    let store = store();
    register_web_on_n1(&store);

    let (index, results) = store.check_service_nodes("web").unwrap();
    assert_eq!(index, 3);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node.address, "10.0.0.1");
    assert_eq!(results[0].service.port, 80);
    assert!(results[0]
        .checks
        .iter()
        .any(|c| c.check_id == "web-ping" && c.status == HEALTH_PASSING));
}

#[test]
fn deleting_the_service_removes_its_checks_and_advances_watermarks() {
    let store = store();
    register_web_on_n1(&store);

    store.delete_node_service(5, "n1", "web").unwrap();

    let (_, results) = store.check_service_nodes("web").unwrap();
    assert!(results.is_empty());

    let (checks_index, checks) = store.node_checks("n1").unwrap();
    assert!(checks.is_empty());
    assert_eq!(checks_index, 5);

    let (services_index, services) = store.services().unwrap();
    assert!(services.is_empty());
    assert_eq!(services_index, 5);
}

#[test]
fn kvs_set_preserves_create_index_across_updates() {
    let store = store();
    store
        .kvs_set(
            10,
            &DirEntry {
                key: "a/b".to_string(),
                value: b"v1".to_vec(),
                ..DirEntry::default()
            },
        )
        .unwrap();
    store
        .kvs_set(
            12,
            &DirEntry {
                key: "a/b".to_string(),
                value: b"v2".to_vec(),
                ..DirEntry::default()
            },
        )
        .unwrap();

    let (_, found) = store.kvs_get("a/b").unwrap();
    let found = found.unwrap();
    assert_eq!(found.create_index, 10);
    assert_eq!(found.modify_index, 12);
    assert_eq!(found.value, b"v2");
}

#[test]
fn check_and_set_follows_the_modify_index_contract() {
    let store = store();
    let mut entry = DirEntry {
        key: "c".to_string(),
        ..DirEntry::default()
    };

    // Set-if-absent, then the same attempt against an existing key.
    assert!(store.kvs_check_and_set(20, &entry).unwrap());
    assert!(!store.kvs_check_and_set(21, &entry).unwrap());

    // Matching the stored modify index wins exactly once.
    entry.modify_index = 20;
    entry.value = b"z".to_vec();
    assert!(store.kvs_check_and_set(22, &entry).unwrap());
    entry.modify_index = 20;
    assert!(!store.kvs_check_and_set(23, &entry).unwrap());

    let (_, stored) = store.kvs_get("c").unwrap();
    let stored = stored.unwrap();
    assert_eq!(stored.value, b"z");
    assert_eq!(stored.modify_index, 22);
}

#[test]
fn sessions_attach_to_healthy_checks_only() {
    let store = store();
    store
        .ensure_node(
            1,
            &Node {
                node: "n1".to_string(),
                address: "10.0.0.1".to_string(),
            },
        )
        .unwrap();
    store
        .ensure_check(
            2,
            &HealthCheck {
                node: "n1".to_string(),
                check_id: "c1".to_string(),
                name: "c1".to_string(),
                status: HEALTH_PASSING.to_string(),
                ..HealthCheck::default()
            },
        )
        .unwrap();

    let mut session = Session {
        node: "n1".to_string(),
        checks: vec!["c1".to_string()],
        ..Session::default()
    };
    store.session_create(30, &mut session).unwrap();
    assert!(!session.id.is_empty());

    // Flip the check critical: the next session is refused.
    store
        .ensure_check(
            31,
            &HealthCheck {
                node: "n1".to_string(),
                check_id: "c1".to_string(),
                name: "c1".to_string(),
                status: HEALTH_CRITICAL.to_string(),
                ..HealthCheck::default()
            },
        )
        .unwrap();
    let mut refused = Session {
        node: "n1".to_string(),
        checks: vec!["c1".to_string()],
        ..Session::default()
    };
    let err = store.session_create(32, &mut refused).unwrap_err();
    assert!(matches!(err, StateError::CheckCritical(_, _)));
}

#[test]
fn list_keys_collapses_directories_at_the_separator() {
    let store = store();
    for (i, key) in ["foo/", "foo/a", "foo/a/1", "foo/b"].iter().enumerate() {
        store
            .kvs_set(
                i as u64 + 1,
                &DirEntry {
                    key: key.to_string(),
                    ..DirEntry::default()
                },
            )
            .unwrap();
    }

    let (_, keys) = store.kvs_list_keys("foo/", "/").unwrap();
    assert_eq!(keys, vec!["foo/", "foo/a", "foo/a/", "foo/b"]);
}

#[test]
fn watchers_wake_after_commit_and_pair_with_query_groups() {
    let store = store();
    let tables = store.query_tables("ServiceNodes").unwrap().to_vec();
    assert_eq!(tables, vec![TableId::Nodes, TableId::Services]);

    let (tx, rx) = channel();
    store.watch(&tables, &tx);

    store
        .ensure_node(
            1,
            &Node {
                node: "n1".to_string(),
                address: "10.0.0.1".to_string(),
            },
        )
        .unwrap();

    // The nodes group fired; the services group still holds its waiter
    // for a later write.
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());

    store
        .ensure_service(
            2,
            "n1",
            &NodeService {
                id: "web".to_string(),
                service: "web".to_string(),
                tags: vec![],
                port: 80,
            },
        )
        .unwrap();
    assert!(rx.try_recv().is_ok());
}

#[test]
fn snapshot_restore_roundtrip() {
    let source = store();
    register_web_on_n1(&source);
    source
        .kvs_set(
            7,
            &DirEntry {
                key: "cfg/x".to_string(),
                value: b"1".to_vec(),
                ..DirEntry::default()
            },
        )
        .unwrap();

    let snap = source.snapshot().unwrap();
    let last_index = snap.last_index();
    assert_eq!(last_index, 7);

    // Drain the snapshot into a fresh store the way a restore would.
    let target = store();
    for node in snap.nodes().unwrap() {
        target.ensure_node(last_index, &node).unwrap();
    }
    for node in snap.nodes().unwrap() {
        let services = snap.node_services(&node.node).unwrap().unwrap();
        for service in services.services.values() {
            target.ensure_service(last_index, &node.node, service).unwrap();
        }
        for check in snap.node_checks(&node.node).unwrap() {
            target.ensure_check(last_index, &check).unwrap();
        }
    }
    let (tx, rx) = sync_channel(16);
    let collector = std::thread::spawn(move || rx.iter().collect::<Vec<DirEntry>>());
    snap.kvs_dump(tx).unwrap();
    for entry in collector.join().unwrap() {
        target.kvs_restore(&entry).unwrap();
    }
    snap.close().unwrap();

    let (_, results) = target.check_service_nodes("web").unwrap();
    assert_eq!(results.len(), 1);
    let (kvs_index, entry) = target.kvs_get("cfg/x").unwrap();
    assert_eq!(entry.unwrap().value, b"1");
    assert_eq!(kvs_index, 7);
}

#[test]
fn snapshot_ignores_later_writes() {
    let store = store();
    register_web_on_n1(&store);

    let snap = store.snapshot().unwrap();
    store
        .ensure_node(
            20,
            &Node {
                node: "n2".to_string(),
                address: "10.0.0.2".to_string(),
            },
        )
        .unwrap();

    assert_eq!(snap.last_index(), 3);
    assert_eq!(snap.nodes().unwrap().len(), 1);
    snap.close().unwrap();

    // The live store sees both.
    let (_, nodes) = store.nodes().unwrap();
    assert_eq!(nodes.len(), 2);
}
