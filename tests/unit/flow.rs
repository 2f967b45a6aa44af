use flowcast::flow::evaluator::{compare, evaluate_condition, select_edge, trigger_matches, ConditionOutcome};
use flowcast::flow::{
    ConditionConfig, ConditionMode, FlowEdge, FlowGraph, GraphError, NodeKind, Operator, SwitchCase, TriggerConfig,
};
use serde_json::{json, Map};

fn edge(target: &str, label: Option<&str>, handle: Option<&str>) -> FlowEdge {
    FlowEdge {
        id: None,
        source: "cond".to_string(),
        target: target.to_string(),
        label: label.map(str::to_string),
        handle: handle.map(str::to_string),
    }
}

fn graph(value: serde_json::Value) -> FlowGraph {
    serde_json::from_value(value).unwrap()
}

#[test]
fn test_validate_requires_trigger() {
    let g = graph(json!({"nodes": [{"id": "m", "type": "text", "data": {"text": "hi"}}]}));
    assert_eq!(g.validate(), Err(GraphError::MissingTrigger));
}

#[test]
fn test_validate_dangling_edge() {
    let g = graph(json!({
        "nodes": [{"id": "t", "type": "trigger"}],
        "edges": [{"source": "t", "target": "ghost"}]
    }));
    assert!(matches!(g.validate(), Err(GraphError::DanglingEdge { .. })));
}

#[test]
fn test_validate_duplicate_node() {
    let g = graph(json!({
        "nodes": [{"id": "t", "type": "trigger"}, {"id": "t", "type": "stop"}]
    }));
    assert_eq!(g.validate(), Err(GraphError::DuplicateNode("t".to_string())));
}

#[test]
fn test_legacy_action_node_parses() {
    let g = graph(json!({
        "nodes": [
            {"id": "t", "type": "trigger"},
            {"id": "a", "type": "action", "data": {"action": "tag", "integration": "crm_a"}}
        ]
    }));
    match &g.node("a").unwrap().kind {
        NodeKind::Action(cfg) => assert_eq!(cfg.action, "tag"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(g.node("a").unwrap().kind.is_auto_advance());
    assert!(!g.node("t").unwrap().kind.is_auto_advance());
}

#[test]
fn test_condition_node_json() {
    let g = graph(json!({
        "nodes": [
            {"id": "t", "type": "trigger"},
            {"id": "c", "type": "condition", "data": {
                "mode": "switch",
                "cases": [{"operator": "startsWith", "value": "a"}, {"operator": "regex", "value": "^b"}]
            }}
        ]
    }));
    let NodeKind::Condition(cfg) = &g.node("c").unwrap().kind else {
        panic!("not a condition");
    };
    assert_eq!(cfg.mode, ConditionMode::Switch);
    assert_eq!(cfg.cases[1].operator, Operator::Regex);
}

#[test]
fn test_trigger_keywords() {
    let cfg = TriggerConfig {
        keywords: vec!["promo".to_string(), "  Black   Friday ".to_string()],
        ..TriggerConfig::default()
    };
    assert!(trigger_matches(&cfg, "PROMO"));
    assert!(trigger_matches(&cfg, "is black friday on?"));
    assert!(!trigger_matches(&cfg, "hello"));
    assert!(trigger_matches(&TriggerConfig::default(), "anything"));
}

#[test]
fn test_evaluation_is_deterministic() {
    let cfg = ConditionConfig {
        operator: Operator::Contains,
        value: "sim".to_string(),
        ..ConditionConfig::default()
    };
    for text in ["Sim, quero", "nao", "", "SIMPLES"] {
        let first = evaluate_condition(&cfg, text, &Map::new());
        for _ in 0..5 {
            assert_eq!(evaluate_condition(&cfg, text, &Map::new()), first);
        }
    }
}

#[test]
fn test_boolean_edges_accept_locale_synonyms() {
    let yes = edge("y", Some("Sim"), None);
    let no = edge("n", Some("Não"), None);
    let edges = vec![&yes, &no];
    assert_eq!(select_edge(&edges, &ConditionOutcome::Branch(true)).unwrap().target, "y");
    assert_eq!(select_edge(&edges, &ConditionOutcome::Branch(false)).unwrap().target, "n");
}

#[test]
fn test_boolean_handle_wins_over_label() {
    let a = edge("a", Some("whatever"), Some("false"));
    let b = edge("b", None, Some("true"));
    let edges = vec![&a, &b];
    assert_eq!(select_edge(&edges, &ConditionOutcome::Branch(true)).unwrap().target, "b");
}

#[test]
fn test_missing_false_branch_ends_walk() {
    let yes = edge("y", None, Some("true"));
    let edges = vec![&yes];
    assert!(select_edge(&edges, &ConditionOutcome::Branch(false)).is_none());
}

#[test]
fn test_switch_routes_case_and_default() {
    let cfg = ConditionConfig {
        mode: ConditionMode::Switch,
        cases: vec![
            SwitchCase { operator: Operator::Equals, value: "1".to_string() },
            SwitchCase { operator: Operator::Equals, value: "2".to_string() },
        ],
        ..ConditionConfig::default()
    };
    let first = edge("first", None, Some("case-0"));
    let second = edge("second", None, Some("case-1"));
    let fallback = edge("fallback", None, Some("default"));
    let edges = vec![&first, &second, &fallback];

    let outcome = evaluate_condition(&cfg, "2", &Map::new());
    assert_eq!(outcome, ConditionOutcome::Case(1));
    assert_eq!(select_edge(&edges, &outcome).unwrap().target, "second");
    assert_eq!(outcome.variables("c")["condition_c"], json!("case-1"));

    let miss = evaluate_condition(&cfg, "9", &Map::new());
    assert_eq!(miss, ConditionOutcome::NoMatch);
    assert_eq!(select_edge(&edges, &miss).unwrap().target, "fallback");
    assert_eq!(miss.variables("c")["condition_c"], json!("no_match"));
}

#[test]
fn test_no_match_without_default_takes_first_edge() {
    let first = edge("first", None, Some("case-0"));
    let edges = vec![&first];
    assert_eq!(select_edge(&edges, &ConditionOutcome::NoMatch).unwrap().target, "first");
}

#[test]
fn test_compare_operators() {
    assert!(compare(Operator::Regex, "ORDER-77", "^order-\\d+$"));
    assert!(!compare(Operator::Equals, "yes please", "yes"));
    assert!(compare(Operator::NotEquals, "", "x"));
}
