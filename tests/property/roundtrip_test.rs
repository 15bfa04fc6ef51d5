// tests/property/roundtrip_test.rs

//! Round-trip properties of the persisted state: any valid registry
//! serializes to a Process Status File document and comes back equal.

use ms_controller::core::persist::{PersistedNode, ProcessStatusDoc};
use ms_controller::core::types::{
    InferenceType, InstanceDynamicInfo, InstanceStaticInfo, Label, NodeInfo, Role, RoleState,
    compose_node_id,
};
use proptest::prelude::*;

fn arb_role() -> impl Strategy<Value = Role> {
    prop_oneof![
        Just(Role::Undefined),
        Just(Role::Prefill),
        Just(Role::Decode),
        Just(Role::Flex),
    ]
}

fn arb_role_state() -> impl Strategy<Value = RoleState> {
    prop_oneof![
        Just(RoleState::Unknown),
        Just(RoleState::Switching),
        Just(RoleState::Ready),
    ]
}

fn arb_label() -> impl Strategy<Value = Label> {
    prop_oneof![
        Just(Label::PrefillPrefer),
        Just(Label::DecodePrefer),
        Just(Label::PrefillStatic),
        Just(Label::DecodeStatic),
        Just(Label::FlexStatic),
    ]
}

prop_compose! {
    fn arb_node()(
        group in 0u64..6,
        ordinal in 1u64..1000,
        octet in 1u8..255,
        port in 1024u16..65535,
        healthy in any::<bool>(),
        initialized in any::<bool>(),
        delete_time in 0u64..86400,
        role in arb_role(),
        role_state in arb_role_state(),
        label in arb_label(),
        peers in proptest::collection::vec(1u64..1000, 0..8),
        slots in 0u64..5000,
        blocks in 0u64..4_000_000,
        flex_p_ratio in 0u64..=100,
    ) -> NodeInfo {
        let id = compose_node_id(group, ordinal);
        NodeInfo {
            id,
            host_id: format!("host-{ordinal}"),
            ip: format!("10.0.{group}.{octet}"),
            port,
            mgmt_port: port.saturating_add(1).max(1024),
            metric_port: port.saturating_add(2).max(1024),
            inter_comm_port: port.saturating_add(3).max(1024),
            model_name: "llama".into(),
            is_healthy: healthy,
            is_initialized: initialized,
            inference_type: InferenceType::PdSeparate,
            current_role: role,
            role_state,
            delete_time,
            peers,
            active_peers: vec![],
            static_info: InstanceStaticInfo {
                id,
                group_id: group,
                max_seq_len: 8192,
                max_output_len: 1024,
                total_slots_num: slots,
                total_block_num: blocks,
                block_size: 128,
                label,
                role,
                flex_p_ratio,
                virtual_id: ordinal,
            },
            dynamic_info: InstanceDynamicInfo {
                avail_slots_num: slots / 2,
                avail_block_num: blocks / 2,
                ..Default::default()
            },
            server_info_list: vec![],
            probe_failures: 0,
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_status_doc_round_trips_through_json(
        nodes in proptest::collection::vec(arb_node(), 0..16),
        counter in 1u64..100_000,
        faulty_mask in any::<u16>(),
    ) {
        let server: Vec<PersistedNode> = nodes
            .into_iter()
            .enumerate()
            .map(|(index, node)| {
                let is_faulty = faulty_mask & (1u16 << (index % 16)) != 0;
                PersistedNode {
                    node,
                    is_faulty,
                    faulty_reason: if is_faulty { "unreachable".into() } else { String::new() },
                }
            })
            .collect();
        let doc = ProcessStatusDoc {
            server,
            instance_start_id_number: counter,
            processed_switch_faults: serde_json::Value::Null,
        };

        let rendered = serde_json::to_string(&doc).unwrap();
        let reloaded: ProcessStatusDoc = serde_json::from_str(&rendered).unwrap();
        prop_assert_eq!(reloaded, doc);
    }

    #[test]
    fn test_node_ids_survive_the_wire_encoding(
        group in 0u64..6,
        ordinal in 1u64..1_000_000,
    ) {
        use ms_controller::core::types::{node_group, node_ordinal};
        let id = compose_node_id(group, ordinal);
        prop_assert_eq!(node_group(id), group);
        prop_assert_eq!(node_ordinal(id), ordinal);
        let rendered = serde_json::to_string(&id).unwrap();
        let reloaded: u64 = serde_json::from_str(&rendered).unwrap();
        prop_assert_eq!(reloaded, id);
    }
}
