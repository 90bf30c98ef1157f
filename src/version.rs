const fn unwrap_or_cargo_version(opt: Option<&'static str>) -> &'static str {
    match opt {
        Some(val) => val,
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// Hub version, overridable at build time through `APP_VERSION`.
pub const VERSION: &str = unwrap_or_cargo_version(option_env!("APP_VERSION"));

/// Engine release the generated configs target.
pub const CORE_VERSION: &str = "Xray v1.8.13";
