//! Property-based tests for the core pipeline
//!
//! 1. Predicate algebra matches boolean logic
//! 2. Property decoder never panics and honours the supported tag set
//! 3. Reverse lookup cache case-folding
//! 4. Provider registry lookups agree by name and id

use krabtrace::decoder::{self, InType, PropertyValue};
use krabtrace::dns::ReverseLookupCache;
use krabtrace::filter::Predicate;
use krabtrace::record::{EventRecord, Property};
use krabtrace::registry::ProviderRegistry;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use uuid::Uuid;

fn record(pid: u32, id: u16, image: &str) -> EventRecord {
    EventRecord::builder("Test-Provider", Uuid::nil(), id)
        .process(pid)
        .property(Property::unicode("ImageName", image))
        .build()
}

fn leaf() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        Just(Predicate::any()),
        (0u32..4).prop_map(Predicate::process_id_equals),
        (0u16..4).prop_map(Predicate::event_id_equals),
        ("[a-c]{1,2}", any::<bool>())
            .prop_map(|(needle, cs)| Predicate::string_contains("ImageName", &needle, cs)),
    ]
}

fn tree() -> impl Strategy<Value = Predicate> {
    leaf().prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.and(b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.or(b)),
            inner.prop_map(Predicate::negate),
        ]
    })
}

fn arb_record() -> impl Strategy<Value = EventRecord> {
    (0u32..4, 0u16..4, "[a-cA-C]{0,4}").prop_map(|(pid, id, image)| record(pid, id, &image))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_and_or_not_follow_boolean_logic(p in tree(), q in tree(), r in arb_record()) {
        let (pv, qv) = (p.evaluate(&r), q.evaluate(&r));
        prop_assert_eq!(p.clone().and(q.clone()).evaluate(&r), pv && qv);
        prop_assert_eq!(p.clone().or(q.clone()).evaluate(&r), pv || qv);
        prop_assert_eq!(Predicate::negate(p).evaluate(&r), !pv);
    }

    #[test]
    fn prop_or_association_irrelevant(a in tree(), b in tree(), c in tree(), r in arb_record()) {
        let left = a.clone().or(b.clone()).or(c.clone());
        let right = a.or(b.or(c));
        prop_assert_eq!(left.evaluate(&r), right.evaluate(&r));
    }

    #[test]
    fn prop_canonical_form_reparses(p in leaf(), r in arb_record()) {
        // Leaves print in expression syntax
        if let Ok(reparsed) = Predicate::from_expr(&p.to_string()) {
            prop_assert_eq!(reparsed.evaluate(&r), p.evaluate(&r));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_decoder_never_panics(tag in any::<u16>(), data in prop::collection::vec(any::<u8>(), 0..32)) {
        let value = decoder::decode_raw(tag, "field", &data);
        match InType::from_raw(tag) {
            Some(kind) if kind.is_supported() => {}
            _ => prop_assert_eq!(value, PropertyValue::Unavailable),
        }
    }

    #[test]
    fn prop_supported_integers_decode(v in any::<u32>(), w in any::<i64>()) {
        prop_assert_eq!(decoder::decode(&Property::u32("a", v)), PropertyValue::U32(v));
        prop_assert_eq!(decoder::decode(&Property::i64("b", w)), PropertyValue::I64(w));
    }

    #[test]
    fn prop_unicode_strings_decode(s in "[a-zA-Z0-9 .:\\\\-]{0,40}") {
        prop_assert_eq!(
            decoder::decode(&Property::unicode("s", &s)),
            PropertyValue::String(s.clone())
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_cache_case_folds(name in "[a-zA-Z]{1,12}(\\.[a-zA-Z]{2,5})?", octet in any::<u8>()) {
        let cache = ReverseLookupCache::new();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet));
        cache.record_resolution(addr, &name.to_uppercase());
        cache.record_resolution(addr, &name.to_lowercase());

        let names = cache.names_for_address(&addr);
        prop_assert_eq!(names.len(), 1);
        prop_assert!(cache.addresses_for_name(&name).contains(&addr));
    }

    #[test]
    fn prop_registry_name_and_id_agree(name in "[A-Za-z-]{1,20}", raw in any::<u128>()) {
        let registry: ProviderRegistry<String> = ProviderRegistry::new();
        let id = Uuid::from_u128(raw);
        registry.register(&name, id, Arc::new(name.clone()));

        let by_name = registry.resolve_by_name(&name).unwrap();
        let by_id = registry.resolve_by_id(&id).unwrap();
        prop_assert!(Arc::ptr_eq(&by_name, &by_id));

        registry.unregister_by_name(&name).unwrap();
        prop_assert!(registry.resolve_by_name(&name).is_err());
        prop_assert!(registry.resolve_by_id(&id).is_err());
    }
}
