use std::path::PathBuf;

use chrono::{Duration, TimeZone, Utc};
use ledger_core::{CanonicalRecord, EntityId, EntityRef, EntityType, NarrativeSection, Revision};
use ledger_renderer::marker::{live_begin, live_end, strip_live_sections, strip_marker};
use ledger_renderer::{ArtifactContext, LiveItem, LiveSection, Renderer};

fn acme() -> EntityRef {
    EntityRef {
        id: EntityId::from("acme"),
        entity_type: EntityType::Account,
        name: "Acme".to_string(),
        dir: PathBuf::from("/ws/Accounts/Acme"),
    }
}

fn make_record(health: &str) -> CanonicalRecord {
    let mut record = CanonicalRecord::new(EntityType::Account);
    record.set_field("health", health);
    record.set_field("renewalDate", "2026-12-01");
    record.set_field("arr", 120_000i64);
    record.narrative.overview = Some("Regional freight carrier.".to_string());
    record.narrative.notes = Some("Prefers async updates.".to_string());
    record.narrative.sections.push(NarrativeSection {
        title: "Stakeholders".to_string(),
        content: "- Dana (VP Ops)\n- Lee (IT)".to_string(),
    });
    record.enrichment.insert(
        "overview".to_string(),
        Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap(),
    );
    record
}

fn live() -> Vec<LiveSection> {
    vec![LiveSection {
        key: "signals".to_string(),
        title: "Signals".to_string(),
        items: vec![LiveItem::new("Renewal in 43 days")],
        degraded: false,
    }]
}

#[test]
fn same_inputs_render_identically_apart_from_timestamp() {
    let renderer = Renderer::new().expect("renderer");
    let record = make_record("green");
    let revision = Revision::of("canonical bytes");
    let t1 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
    let t2 = t1 + Duration::minutes(5);

    let first = renderer
        .render(&ArtifactContext::build(&acme(), &record, &revision, &live(), t1))
        .expect("render 1");
    let second = renderer
        .render(&ArtifactContext::build(&acme(), &record, &revision, &live(), t2))
        .expect("render 2");

    assert_ne!(first, second, "marker timestamps differ");
    assert_eq!(strip_marker(&first), strip_marker(&second));
}

#[test]
fn health_change_flows_into_header_badge() {
    let renderer = Renderer::new().expect("renderer");
    let now = Utc::now();

    let green = renderer
        .render(&ArtifactContext::build(
            &acme(),
            &make_record("green"),
            &Revision::of("a"),
            &[],
            now,
        ))
        .expect("render green");
    let yellow = renderer
        .render(&ArtifactContext::build(
            &acme(),
            &make_record("yellow"),
            &Revision::of("b"),
            &[],
            now,
        ))
        .expect("render yellow");

    assert!(green.contains("Health: 🟢 green"));
    assert!(yellow.contains("Health: 🟡 yellow"));
    assert!(!yellow.contains("🟢"));
}

#[test]
fn artifact_contains_every_canonical_section() {
    let renderer = Renderer::new().expect("renderer");
    let doc = renderer
        .render(&ArtifactContext::build(
            &acme(),
            &make_record("red"),
            &Revision::of("c"),
            &live(),
            Utc::now(),
        ))
        .expect("render");

    for needle in [
        "# Acme",
        "| renewalDate | 2026-12-01 |",
        "| arr | 120000 |",
        "## Overview\n\nRegional freight carrier.",
        "## Notes\n\nPrefers async updates.",
        "## Stakeholders\n\n- Dana (VP Ops)\n- Lee (IT)",
        "- overview refreshed 2026-10-01T08:00:00Z",
        "- Renewal in 43 days",
    ] {
        assert!(doc.contains(needle), "missing {needle:?} in:\n{doc}");
    }
    let begin = doc.find(&live_begin("signals")).expect("live block");
    let end = doc.find(&live_end("signals")).expect("live block end");
    assert!(
        doc[begin..end].contains("do not edit, changes here are discarded"),
        "live block lacks the do-not-edit notice:\n{doc}"
    );
    let narrative_only = strip_live_sections(&doc);
    assert!(!narrative_only.contains("do not edit"));
    assert!(!narrative_only.contains("Renewal in 43 days"));
}

#[test]
fn empty_record_renders_minimal_document() {
    let renderer = Renderer::new().expect("renderer");
    let record = CanonicalRecord::new(EntityType::Project);
    let entity = EntityRef {
        id: EntityId::from("rollout"),
        entity_type: EntityType::Project,
        name: "Rollout".to_string(),
        dir: PathBuf::from("/ws/Projects/Rollout"),
    };
    let doc = renderer
        .render(&ArtifactContext::build(
            &entity,
            &record,
            &Revision::of("{}"),
            &[],
            Utc::now(),
        ))
        .expect("render");
    assert!(doc.contains("Project · `rollout` · Health: ⚪ unknown"));
    assert!(!doc.contains("## Fields"));
    assert!(!doc.contains("## Overview"));
}
