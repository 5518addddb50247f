use sleuth_core::flow::{FlowBranch, FlowEdge, FlowNode, StepStatus};
use sleuth_engine::compile;

fn parse_nodes(raw: &str) -> Vec<FlowNode> {
    serde_json::from_str(raw).expect("parse nodes")
}

fn parse_edges(raw: &str) -> Vec<FlowEdge> {
    serde_json::from_str(raw).expect("parse edges")
}

#[test]
fn linear_flow_over_the_wire_contract() {
    // Scenario: A -> B -> C with one seed, exactly one branch with
    // strictly increasing depth.
    let nodes = parse_nodes(
        r#"[
            {"id": "seed-1", "type": "seed",
             "outputsSchema": {"properties": {"value": {"type": "string"}}}},
            {"id": "domain_resolve-1", "type": "transform",
             "outputsSchema": {"properties": {"ip": {"type": "string"}}}},
            {"id": "ip_geolocate-1", "type": "transform",
             "outputsSchema": {"properties": {"country": {"type": "string"}}}}
        ]"#,
    );
    let edges = parse_edges(
        r#"[
            {"id": "e1", "source": "seed-1", "target": "domain_resolve-1",
             "sourceHandle": "value", "targetHandle": "domain"},
            {"id": "e2", "source": "domain_resolve-1", "target": "ip_geolocate-1",
             "sourceHandle": "ip", "targetHandle": "ip"}
        ]"#,
    );

    let branches = compile(&nodes, &edges, "example.com");
    assert_eq!(branches.len(), 1);

    let steps = &branches[0].steps;
    assert_eq!(steps.len(), 3);
    for (i, step) in steps.iter().enumerate() {
        assert_eq!(step.depth, i);
        assert_eq!(step.status, StepStatus::Pending);
    }

    // The seed's sample output carries the seed value
    assert_eq!(steps[0].outputs["value"], serde_json::json!("example.com"));
    // The geolocate step's binding records the edge's handle pair
    let binding = steps[2].inputs.get("ip").expect("ip binding");
    assert_eq!(binding.source, "domain_resolve-1");
    assert_eq!(binding.handle, "ip");
}

#[test]
fn forked_flow_diverges_after_the_seed() {
    // Scenario: A -> B, A -> C: two branches, both starting at A,
    // diverging at depth 1.
    let nodes = parse_nodes(
        r#"[
            {"id": "a", "type": "seed"},
            {"id": "b", "type": "transform"},
            {"id": "c", "type": "transform"}
        ]"#,
    );
    let edges = parse_edges(
        r#"[
            {"id": "e1", "source": "a", "target": "b"},
            {"id": "e2", "source": "a", "target": "c"}
        ]"#,
    );

    let branches = compile(&nodes, &edges, "seed");
    assert_eq!(branches.len(), 2);

    let mut tails: Vec<&str> = branches
        .iter()
        .map(|b| {
            assert_eq!(b.steps[0].node_id, "a");
            assert_eq!(b.steps[1].depth, 1);
            b.steps[1].node_id.as_str()
        })
        .collect();
    tails.sort_unstable();
    assert_eq!(tails, vec!["b", "c"]);
}

#[test]
fn compiled_branches_serialize_for_the_response() {
    let nodes = parse_nodes(r#"[{"id": "a", "type": "seed"}]"#);
    let branches = compile(&nodes, &[], "x");

    let json = serde_json::to_value(&branches).unwrap();
    let step = &json[0]["steps"][0];
    assert_eq!(step["nodeId"], "a");
    assert_eq!(step["branchId"], json[0]["id"]);
    assert_eq!(step["status"], "pending");

    // And back again
    let parsed: Vec<FlowBranch> = serde_json::from_value(json).unwrap();
    assert_eq!(parsed[0].steps.len(), 1);
}

#[test]
fn compile_is_repeatable_for_previews() {
    let nodes = parse_nodes(
        r#"[
            {"id": "a", "type": "seed"},
            {"id": "b", "type": "transform"},
            {"id": "c", "type": "transform"}
        ]"#,
    );
    let edges = parse_edges(
        r#"[
            {"id": "e1", "source": "a", "target": "b"},
            {"id": "e2", "source": "b", "target": "c"},
            {"id": "e3", "source": "c", "target": "a"}
        ]"#,
    );

    let first = compile(&nodes, &edges, "x");
    let second = compile(&nodes, &edges, "x");
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
}
