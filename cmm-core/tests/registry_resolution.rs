//! Resolution against the bundled provider manifest

use std::sync::Arc;

use cmm_core::{
    CMMError, CapabilityKind, ContextCache, ModuleRegistry, PropertySnapshot, Provider, ProviderDescriptor,
    ProviderManifest, ResolveRequest,
};

const MANIFEST: &str = include_str!("../manifests/providers.json");

fn loaded_registry() -> ModuleRegistry {
    let manifest = ProviderManifest::from_json(MANIFEST).expect("bundled manifest parses");
    let registry = ModuleRegistry::new();
    let report = registry.load(&manifest);
    assert!(report.skipped.is_empty(), "skipped: {:?}", report.skipped);
    registry
}

fn ids(registry: &ModuleRegistry, request: &ResolveRequest) -> Vec<String> {
    registry
        .resolve_all(request)
        .expect("resolution succeeds")
        .iter()
        .map(|c| c.provider.id().to_string())
        .collect()
}

fn icc_request() -> ResolveRequest {
    ResolveRequest::new(CapabilityKind::ContextBuilder, "//openicc/icc").expect("valid pattern")
}

#[test]
fn test_manifest_registers_every_provider() {
    let registry = loaded_registry();
    assert_eq!(registry.len(), 6);
    assert_eq!(registry.providers(CapabilityKind::ContextBuilder).len(), 4);
    assert_eq!(registry.providers(CapabilityKind::Processor).len(), 2);
    assert!(registry.providers(CapabilityKind::Loader).is_empty());
}

#[test]
fn test_doubles_collapse_to_first_registered_on_tie() {
    let registry = loaded_registry();
    // lcms and lcm2 differ only in implementation attributes
    let candidates = registry.resolve_all(&icc_request()).expect("resolution succeeds");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].provider.id(), "org.cmm.lcms");
    assert_eq!(candidates[0].match_score, 2);
    assert_eq!(candidates[0].rank, 3);
}

#[test]
fn test_declared_property_lifts_the_gpu_double() {
    let registry = loaded_registry();

    let gpu = icc_request().with_properties(PropertySnapshot::new().with("gpu", "yes"));
    let candidates = registry.resolve_all(&gpu).expect("resolution succeeds");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].provider.id(), "org.cmm.lcm2");
    assert_eq!(candidates[0].rank, 5);

    let no_gpu = icc_request().with_properties(PropertySnapshot::new().with("gpu", "no"));
    assert_eq!(ids(&registry, &no_gpu), vec!["org.cmm.lcms"]);
}

#[test]
fn test_optional_and_forbidden_attributes() {
    let registry = loaded_registry();

    let optional = ResolveRequest::new(CapabilityKind::ContextBuilder, "//openicc/icc._lcm2").expect("valid pattern");
    let candidates = registry.resolve_all(&optional).expect("resolution succeeds");
    assert_eq!(candidates[0].provider.id(), "org.cmm.lcm2");
    assert_eq!(candidates[0].rank, 4);

    let forbidden = ResolveRequest::new(CapabilityKind::ContextBuilder, "//openicc/icc.-lcm2").expect("valid pattern");
    assert_eq!(ids(&registry, &forbidden), vec!["org.cmm.lcms"]);

    let mandatory = ResolveRequest::new(CapabilityKind::ContextBuilder, "//openicc/icc+lcm2").expect("valid pattern");
    assert_eq!(ids(&registry, &mandatory), vec!["org.cmm.lcm2"]);
}

#[test]
fn test_stage_bound_attribute_only_applies_at_its_stage() {
    let registry = loaded_registry();

    let builder = registry
        .resolve(CapabilityKind::ContextBuilder, "//openicc/icc.4+lcms", None)
        .expect("builder resolves");
    assert_eq!(builder.id(), "org.cmm.lcms");

    // the processor is registered as lcm2, but the lcms constraint is
    // bound to the context builder stage
    let processor = registry
        .resolve(CapabilityKind::Processor, "//openicc/icc.4+lcms", None)
        .expect("processor resolves");
    assert_eq!(processor.id(), "org.cmm.icc");
}

#[test]
fn test_required_provider_by_attribute_or_id() {
    let registry = loaded_registry();

    let by_attribute = icc_request().with_required_provider("lcm2");
    let candidates = registry.resolve_all(&by_attribute).expect("resolution succeeds");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].provider.id(), "org.cmm.lcm2");
    assert_eq!(candidates[0].rank, 3);

    let by_id = icc_request().with_required_provider("org.cmm.lcms");
    assert_eq!(ids(&registry, &by_id), vec!["org.cmm.lcms"]);

    let nobody = icc_request().with_required_provider("littlecms1");
    assert!(matches!(
        registry.resolve_request(&nobody),
        Err(CMMError::NotFound { .. })
    ));
}

#[test]
fn test_printer_selection_by_device_properties() {
    let registry = loaded_registry();
    let printer = |properties: PropertySnapshot| {
        let request = ResolveRequest::new(CapabilityKind::ContextBuilder, "//config/device")
            .expect("valid pattern")
            .with_properties(properties);
        registry.resolve_all(&request).expect("resolution succeeds")
    };

    let seiko = printer(PropertySnapshot::new().with("manufacturer", "SEIKO EPSON"));
    assert_eq!(seiko.len(), 1);
    assert_eq!(seiko[0].provider.id(), "org.cmm.printer.epson");
    assert_eq!(seiko[0].rank, 12);

    let serial = printer(PropertySnapshot::new().with("serial", "X1234"));
    assert_eq!(serial[0].provider.id(), "org.cmm.printer.epson");

    let both = printer(
        PropertySnapshot::new()
            .with("manufacturer", "EPSON")
            .with("serial", "X1234"),
    );
    assert_eq!(both[0].rank, 22);

    let hp = printer(PropertySnapshot::new().with("manufacturer", "HP"));
    assert_eq!(hp[0].provider.id(), "org.cmm.printer.generic");
    assert_eq!(hp[0].rank, 2);

    // no properties: equal ranks, registration order wins
    let unknown = printer(PropertySnapshot::new());
    assert_eq!(unknown[0].provider.id(), "org.cmm.printer.generic");
}

#[test]
fn test_key_filter_patterns_compare_the_last_segment() {
    let registry = loaded_registry();

    let printers = ResolveRequest::new(CapabilityKind::ContextBuilder, "printer").expect("valid pattern");
    assert_eq!(ids(&registry, &printers), vec!["org.cmm.printer.generic"]);

    let gpu = ResolveRequest::new(CapabilityKind::ContextBuilder, "gpu").expect("valid pattern");
    assert_eq!(ids(&registry, &gpu), vec!["org.cmm.lcm2"]);

    let root = ResolveRequest::new(CapabilityKind::Processor, "root").expect("valid pattern");
    assert_eq!(ids(&registry, &root), vec!["org.cmm.root"]);

    let everything = ResolveRequest::new(CapabilityKind::Processor, "").expect("empty pattern");
    assert_eq!(ids(&registry, &everything), vec!["org.cmm.icc", "org.cmm.root"]);
}

#[test]
fn test_malformed_patterns_are_format_errors() {
    for text in ["//openicc/icc..lcm2", "//openicc/icc.+", "//openicc/icc+"] {
        let err = ResolveRequest::new(CapabilityKind::ContextBuilder, text).unwrap_err();
        assert!(matches!(err, CMMError::FormatError { .. }), "{} gave {:?}", text, err);
    }
}

#[test]
fn test_unmatched_request_is_not_found() {
    let registry = loaded_registry();
    let err = registry
        .resolve(CapabilityKind::Processor, "//colour/convert", None)
        .unwrap_err();
    assert!(matches!(err, CMMError::NotFound { ref pattern, .. } if pattern == "//colour/convert"));
}

#[test]
fn test_loaders_feed_the_registry() {
    let manifest = ProviderManifest::from_json(MANIFEST).expect("bundled manifest parses");
    let registry = ModuleRegistry::new();
    registry
        .register(Provider::loader(
            ProviderDescriptor::new("org.cmm.loader.json", "org/oyranos/cmm/loader.json").expect("valid key"),
            manifest,
        ))
        .expect("loader registers");

    let report = registry.load_via_loaders("//cmm/loader").expect("valid pattern");
    assert_eq!(report.loaded.len(), 6);
    assert!(report.skipped.is_empty());
    assert_eq!(registry.len(), 7);

    // everything is already registered the second time
    let again = registry.load_via_loaders("//cmm/loader").expect("valid pattern");
    assert!(again.loaded.is_empty());
    assert_eq!(again.skipped.len(), 6);
}

#[test]
fn test_memoized_lookups_follow_registry_changes() {
    let cache = Arc::new(ContextCache::new());
    let manifest = ProviderManifest::from_json(MANIFEST).expect("bundled manifest parses");
    let registry = ModuleRegistry::new().with_lookup_cache(cache.clone());
    registry.load(&manifest);

    let request = icc_request().with_required_provider("lcm2");
    assert_eq!(ids(&registry, &request), vec!["org.cmm.lcm2"]);
    assert_eq!(ids(&registry, &request), vec!["org.cmm.lcm2"]);
    assert_eq!(cache.stats().hits, 1);

    assert!(registry.unregister("org.cmm.lcm2").expect("registry writable"));
    assert!(ids(&registry, &request).is_empty());
    assert_eq!(cache.stats().misses, 2);
}
