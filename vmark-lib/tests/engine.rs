use std::path::PathBuf;

use tempfile::TempDir;
use vmark_ebpf_common::FwKey;
use vmark_lib::forwarding::{
    decode_value, Action, MemoryDataplane, RuleEngine, RuleParams, ShowFilter, ShowOutput,
    SnapshotStore,
};
use vmark_lib::NodeError;

const ETH0: u32 = 2;
const ETH1: u32 = 3;
const ETH2: u32 = 4;

struct Fixture {
    engine: RuleEngine<MemoryDataplane>,
    snapshot: PathBuf,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let snapshot = dir.path().join("rules.json");
    let dataplane =
        MemoryDataplane::with_interfaces(&[("eth0", ETH0), ("eth1", ETH1), ("eth2", ETH2)]);
    let engine = RuleEngine::new(SnapshotStore::new(&snapshot), dataplane);
    engine.startup().expect("startup");
    Fixture { engine, snapshot, _dir: dir }
}

fn params(name: &str) -> RuleParams {
    RuleParams {
        name: name.into(),
        in_interface: "eth0".into(),
        out_interface: "eth1".into(),
        ..Default::default()
    }
}

fn r1_params() -> RuleParams {
    RuleParams {
        svlan: Some(100),
        cvlan: Some(10),
        pop_tags: 1,
        push_cvlan: Some(11),
        ..params("r1")
    }
}

fn user_rows(engine: &RuleEngine<MemoryDataplane>) -> Vec<(String, bool)> {
    match engine.show_forwarding(&ShowFilter::All).expect("show") {
        ShowOutput::Rules(views) => views
            .iter()
            .filter(|v| v.rule.origin_name.is_none())
            .map(|v| (v.rule.name.clone(), v.rule.active))
            .collect(),
        _ => panic!("expected rule views"),
    }
}

fn snapshot_rows(path: &PathBuf) -> Vec<(String, bool)> {
    let text = std::fs::read_to_string(path).expect("snapshot file");
    let value: serde_json::Value = serde_json::from_str(&text).expect("snapshot json");
    value["rules"]
        .as_array()
        .expect("rules array")
        .iter()
        .map(|r| {
            (r["name"].as_str().expect("name").to_string(), r["active"].as_bool().expect("active"))
        })
        .collect()
}

#[test]
fn s1_enable_programs_both_directions() {
    let fx = fixture();
    fx.engine.create_rule(r1_params()).unwrap();
    let summary = fx.engine.enable_rule("r1").unwrap();
    assert!(summary.active);
    assert!(summary.applied);

    fx.engine.with_dataplane(|dp| {
        // Forward direction on eth0.
        let map = dp.map_snapshot(ETH0).expect("eth0 map");
        assert_eq!(map.len(), 1);
        let value = map.get(&FwKey::new(ETH0, 10, 100)).expect("forward entry");
        assert_eq!(
            decode_value(value),
            vec![Action::Pop, Action::PushCvlan(11), Action::Forward(ETH1)]
        );

        // Inverse direction on eth1: match the retagged C-VLAN, restore
        // both original tags.
        let map = dp.map_snapshot(ETH1).expect("eth1 map");
        assert_eq!(map.len(), 1);
        let value = map.get(&FwKey::new(ETH1, 11, 0)).expect("inverse entry");
        assert_eq!(
            decode_value(value),
            vec![
                Action::Pop,
                Action::PushCvlan(10),
                Action::PushSvlan(100),
                Action::Forward(ETH0)
            ]
        );

        assert!(dp.is_attached(ETH0));
        assert!(dp.is_attached(ETH1));
    });
}

#[test]
fn s2_conflicting_enable_rejected_without_side_effects() {
    let fx = fixture();
    fx.engine.create_rule(r1_params()).unwrap();
    fx.engine.enable_rule("r1").unwrap();
    // Same match key as r1, different egress.
    fx.engine
        .create_rule(RuleParams {
            svlan: Some(100),
            cvlan: Some(10),
            out_interface: "eth2".into(),
            ..params("r2")
        })
        .unwrap();

    let err = fx.engine.enable_rule("r2").unwrap_err();
    match err {
        NodeError::Conflict { existing, candidate } => {
            assert_eq!(existing, "r1");
            assert_eq!(candidate, "r2");
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert_eq!(
        user_rows(&fx.engine),
        vec![("r1".to_string(), true), ("r2".to_string(), false)]
    );
    // The kernel still carries exactly r1's entries.
    fx.engine.with_dataplane(|dp| {
        assert_eq!(dp.map_snapshot(ETH0).expect("eth0 map").len(), 1);
    });
}

#[test]
fn s3_startup_with_missing_interface_keeps_rule_unapplied() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("rules.json");

    // Persist r1 active, then restart with eth0 gone.
    {
        let dataplane = MemoryDataplane::with_interfaces(&[("eth0", ETH0), ("eth1", ETH1)]);
        let engine = RuleEngine::new(SnapshotStore::new(&snapshot), dataplane);
        engine.startup().unwrap();
        engine.create_rule(r1_params()).unwrap();
        engine.enable_rule("r1").unwrap();
    }

    let dataplane = MemoryDataplane::with_interfaces(&[("eth1", ETH1)]);
    let engine = RuleEngine::new(SnapshotStore::new(&snapshot), dataplane);
    let report = engine.startup().unwrap();

    // Neither direction is installable: r1's ingress and the inverse's
    // egress are both eth0.
    assert!(report.applied.is_empty());
    assert_eq!(report.skipped.len(), 2);

    // The rule stays persisted-active and is reported as not applied.
    assert_eq!(snapshot_rows(&snapshot), vec![("r1".to_string(), true)]);
    match engine.show_forwarding(&ShowFilter::Name("r1".into())).unwrap() {
        ShowOutput::Rules(views) => {
            assert!(views[0].rule.active);
            assert!(!views[0].applied);
        }
        _ => panic!("expected rule view"),
    }
    engine.with_dataplane(|dp| assert!(!dp.is_attached(ETH1)));
}

#[test]
fn s4_delete_lifecycle() {
    let fx = fixture();
    fx.engine.create_rule(r1_params()).unwrap();
    fx.engine.enable_rule("r1").unwrap();

    assert!(matches!(fx.engine.delete_rule("r1"), Err(NodeError::StateViolation(_))));

    fx.engine.disable_rule("r1").unwrap();
    fx.engine.delete_rule("r1").unwrap();

    assert!(user_rows(&fx.engine).is_empty());
    assert!(snapshot_rows(&fx.snapshot).is_empty());
    fx.engine.with_dataplane(|dp| {
        assert!(!dp.is_attached(ETH0));
        assert!(!dp.is_attached(ETH1));
        assert!(dp.map_snapshot(ETH0).is_none());
        assert!(dp.map_snapshot(ETH1).is_none());
    });
    assert!(matches!(
        fx.engine.show_forwarding(&ShowFilter::Name("r1".into())),
        Err(NodeError::NotFound(_))
    ));
}

#[test]
fn table_and_snapshot_agree_after_any_sequence() {
    let fx = fixture();
    fx.engine.create_rule(r1_params()).unwrap();
    fx.engine.create_rule(RuleParams { svlan: Some(200), ..params("r2") }).unwrap();
    fx.engine.enable_rule("r1").unwrap();
    assert_eq!(user_rows(&fx.engine), snapshot_rows(&fx.snapshot));

    fx.engine.enable_rule("r2").unwrap();
    assert_eq!(user_rows(&fx.engine), snapshot_rows(&fx.snapshot));

    fx.engine.disable_rule("r1").unwrap();
    assert_eq!(user_rows(&fx.engine), snapshot_rows(&fx.snapshot));

    fx.engine.delete_rule("r1").unwrap();
    assert_eq!(user_rows(&fx.engine), snapshot_rows(&fx.snapshot));
    assert_eq!(snapshot_rows(&fx.snapshot), vec![("r2".to_string(), true)]);
}

#[test]
fn inverse_exists_exactly_for_active_rules() {
    let fx = fixture();
    fx.engine.create_rule(r1_params()).unwrap();
    let inverse_count = |engine: &RuleEngine<MemoryDataplane>| match engine
        .show_forwarding(&ShowFilter::All)
        .unwrap()
    {
        ShowOutput::Rules(views) => {
            views.iter().filter(|v| v.rule.origin_name.is_some()).count()
        }
        _ => panic!("expected rule views"),
    };

    assert_eq!(inverse_count(&fx.engine), 0);
    fx.engine.enable_rule("r1").unwrap();
    assert_eq!(inverse_count(&fx.engine), 1);
    fx.engine.disable_rule("r1").unwrap();
    assert_eq!(inverse_count(&fx.engine), 0);
}

#[test]
fn kernel_failure_rolls_back_memory_and_disk() {
    let fx = fixture();
    fx.engine.create_rule(r1_params()).unwrap();

    fx.engine.with_dataplane_mut(|dp| dp.set_fail_map_ops(true));
    let err = fx.engine.enable_rule("r1").unwrap_err();
    assert!(matches!(err, NodeError::Kernel { .. }), "got {err:?}");

    // Memory and disk both show the pre-mutation state.
    assert_eq!(user_rows(&fx.engine), vec![("r1".to_string(), false)]);
    assert_eq!(snapshot_rows(&fx.snapshot), vec![("r1".to_string(), false)]);
    fx.engine.with_dataplane(|dp| {
        assert!(!dp.is_attached(ETH0));
    });

    // The same mutation succeeds once the kernel recovers.
    fx.engine.with_dataplane_mut(|dp| dp.set_fail_map_ops(false));
    fx.engine.enable_rule("r1").unwrap();
    assert_eq!(snapshot_rows(&fx.snapshot), vec![("r1".to_string(), true)]);
}

#[test]
fn duplicate_create_is_rejected() {
    let fx = fixture();
    fx.engine.create_rule(r1_params()).unwrap();
    assert!(matches!(
        fx.engine.create_rule(r1_params()),
        Err(NodeError::StateViolation(_))
    ));
}

#[test]
fn active_on_create_programs_immediately() {
    let fx = fixture();
    let summary = fx
        .engine
        .create_rule(RuleParams { svlan: Some(300), active: true, ..params("r3") })
        .unwrap();
    assert!(summary.active);
    assert!(summary.applied);
    fx.engine.with_dataplane(|dp| {
        assert!(dp.is_attached(ETH0));
        assert_eq!(dp.map_snapshot(ETH0).expect("eth0 map").len(), 1);
    });
}
