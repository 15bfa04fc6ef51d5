// tests/property/assignment_test.rs

//! Properties of ID allocation and role assignment: the ordinal counter
//! never decreases, every group member gets exactly one role, and static
//! labels always bind.

use ms_controller::core::planner::GroupPlan;
use ms_controller::core::scheduler::desired_roles_for_group;
use ms_controller::core::topology::RankTableLoader;
use ms_controller::core::types::{
    InferenceType, InstanceStaticInfo, Label, NodeInfo, Role, RoleState, node_ordinal,
};
use proptest::prelude::*;
use std::path::PathBuf;

fn arb_label() -> impl Strategy<Value = Label> {
    prop_oneof![
        Just(Label::PrefillPrefer),
        Just(Label::DecodePrefer),
        Just(Label::PrefillStatic),
        Just(Label::DecodeStatic),
    ]
}

fn arb_current_role() -> impl Strategy<Value = Role> {
    prop_oneof![
        Just(Role::Undefined),
        Just(Role::Prefill),
        Just(Role::Decode),
    ]
}

fn member(id: u64, role: Role, label: Label) -> NodeInfo {
    NodeInfo {
        id,
        host_id: format!("host-{id}"),
        ip: format!("10.5.0.{id}"),
        port: 2025,
        mgmt_port: 2026,
        metric_port: 2027,
        inter_comm_port: 2028,
        model_name: "llama".into(),
        is_healthy: true,
        is_initialized: true,
        inference_type: InferenceType::PdSeparate,
        current_role: role,
        role_state: RoleState::Ready,
        delete_time: 0,
        peers: vec![],
        active_peers: vec![],
        static_info: InstanceStaticInfo {
            id,
            label,
            role,
            ..Default::default()
        },
        dynamic_info: Default::default(),
        server_info_list: vec![],
        probe_failures: 0,
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_counter_is_monotonic_under_any_op_sequence(
        ops in proptest::collection::vec(
            prop_oneof![
                (0u64..1000).prop_map(|v| (true, v)),
                (0u64..6).prop_map(|g| (false, g)),
            ],
            1..64,
        ),
    ) {
        let loader = RankTableLoader::new(PathBuf::from("unused"), false);
        let mut last = loader.instance_start_id_number();
        for (is_restore, value) in ops {
            if is_restore {
                loader.set_instance_start_id_number(value);
            } else {
                let id = loader.allocate_id(value);
                prop_assert!(node_ordinal(id) < loader.instance_start_id_number());
            }
            let current = loader.instance_start_id_number();
            prop_assert!(current >= last, "counter went backwards: {last} -> {current}");
            last = current;
        }
    }

    #[test]
    fn test_every_member_gets_exactly_one_role(
        seeds in proptest::collection::vec((arb_current_role(), arb_label()), 1..24),
        prefill_count in 0usize..24,
    ) {
        let nodes: Vec<NodeInfo> = seeds
            .into_iter()
            .enumerate()
            .map(|(index, (role, label))| member(index as u64 + 1, role, label))
            .collect();
        let members: Vec<&NodeInfo> = nodes.iter().collect();
        let plan = GroupPlan {
            group_id: 0,
            prefill_count,
            decode_count: nodes.len().saturating_sub(prefill_count),
            flex_count: 0,
            flex_p_ratio: 50,
        };
        let desired = desired_roles_for_group(&members, &plan);

        prop_assert_eq!(desired.len(), nodes.len());
        let mut ids: Vec<u64> = desired.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), nodes.len(), "a member was assigned twice");
        for (_, role) in &desired {
            prop_assert!(matches!(role, Role::Prefill | Role::Decode));
        }
    }

    #[test]
    fn test_static_labels_always_bind(
        seeds in proptest::collection::vec((arb_current_role(), arb_label()), 1..24),
        prefill_count in 0usize..24,
    ) {
        let nodes: Vec<NodeInfo> = seeds
            .into_iter()
            .enumerate()
            .map(|(index, (role, label))| member(index as u64 + 1, role, label))
            .collect();
        let members: Vec<&NodeInfo> = nodes.iter().collect();
        let plan = GroupPlan {
            group_id: 0,
            prefill_count,
            decode_count: nodes.len().saturating_sub(prefill_count),
            flex_count: 0,
            flex_p_ratio: 50,
        };
        let desired = desired_roles_for_group(&members, &plan);
        for node in &nodes {
            let assigned = desired.iter().find(|(id, _)| *id == node.id).unwrap().1;
            match node.static_info.label {
                Label::PrefillStatic => prop_assert_eq!(assigned, Role::Prefill),
                Label::DecodeStatic => prop_assert_eq!(assigned, Role::Decode),
                _ => {}
            }
        }
    }
}
