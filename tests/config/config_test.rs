//! Coverage for config derivation helpers and validation edges.

use std::path::PathBuf;
use std::time::Duration;

use waygate::config::WaygateConfig;
use waygate::transport::TransportKind;

#[test]
fn per_role_paths_derive_from_base_values() {
    let toml_str = r#"
[bridge]
profile_dir = "/srv/waygate/profile"

[session]
dir = "/srv/waygate/sessions"
"#;
    let config = WaygateConfig::from_toml(toml_str).expect("parse");

    assert_eq!(
        config.session_dir_for("support"),
        PathBuf::from("/srv/waygate/sessions/support")
    );
    assert_eq!(config.profile_dir_for("support"), "/srv/waygate/profile-support");
}

#[test]
fn duration_helpers_convert_units() {
    let toml_str = r#"
[session]
safe_age_hours = 2

[aggregator]
delay_ms = 250
seen_ttl_secs = 120
"#;
    let config = WaygateConfig::from_toml(toml_str).expect("parse");

    assert_eq!(config.session.safe_age(), Duration::from_secs(7_200));
    assert_eq!(config.aggregator.delay(), Duration::from_millis(250));
    assert_eq!(config.aggregator.seen_ttl(), Duration::from_secs(120));
}

#[test]
fn cleanup_offset_resolves_and_falls_back() {
    let config = WaygateConfig::default();
    assert_eq!(config.session.utc_offset().local_minus_utc(), -10_800);

    let toml_str = r#"
[session]
cleanup_utc_offset_secs = 999999999
"#;
    let out_of_range = WaygateConfig::from_toml(toml_str).expect("parse");
    // An unrepresentable offset degrades to UTC rather than failing.
    assert_eq!(out_of_range.session.utc_offset().local_minus_utc(), 0);
}

#[test]
fn low_priority_adapter_is_configurable() {
    let config = WaygateConfig::default();
    assert_eq!(
        config.aggregator.low_priority_kind().expect("parse kind"),
        TransportKind::Web
    );

    let flipped = WaygateConfig::from_toml("[aggregator]\nlow_priority = \"socket\"\n")
        .expect("parse");
    assert_eq!(
        flipped.aggregator.low_priority_kind().expect("parse kind"),
        TransportKind::Socket
    );
}

#[test]
fn validation_names_the_offending_field() {
    let mut config = WaygateConfig::default();
    config.bridge.url = "ftp://bridge".to_owned();
    let err = match config.validate() {
        Err(err) => format!("{err:#}"),
        Ok(()) => panic!("validation should fail"),
    };
    assert!(err.contains("bridge"), "error should mention the field: {err}");
}

#[test]
fn empty_role_list_is_rejected() {
    let config = WaygateConfig::from_toml("[daemon]\nroles = []\n").expect("parse");
    assert!(config.validate().is_err());
}
