//! The attribute extraction engine.
//!
//! [`extract`] turns a client address into the request variables bound for
//! it. Every failure (no database, bad address, no record, missing field)
//! only shrinks the output; none of them is reported to the caller.

use log::debug;
use serde::Serialize;

use crate::address;
use crate::config::ScopeConfig;
use crate::mmdb::GeoDatabase;
use crate::record::LocatedEntry;

/// Always bound, holding the address that was evaluated.
pub const ADDR_VARIABLE: &str = "GEOIP_ADDR";

/// A named value to be set in the request's variable table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputVariable {
    pub name: String,
    pub value: String,
}

impl OutputVariable {
    fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        OutputVariable {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A field every lookup tries to bind.
#[derive(Clone, Copy, Debug)]
pub struct WellKnownField {
    pub variable: &'static str,
    pub path: &'static [&'static str],
}

const fn field(variable: &'static str, path: &'static [&'static str]) -> WellKnownField {
    WellKnownField { variable, path }
}

/// The fixed field set, in binding order.
pub const WELL_KNOWN_FIELDS: &[WellKnownField] = &[
    field("GEOIP_LATITUDE", &["location", "latitude"]),
    field("GEOIP_LONGITUDE", &["location", "longitude"]),
    field("GEOIP_METRO_CODE", &["location", "metro_code"]),
    field("GEOIP_TIME_ZONE", &["location", "time_zone"]),
    field("GEOIP_CONTINENT_CODE", &["continent", "code"]),
    field("GEOIP_CONTINENT_NAME", &["continent", "names", "en"]),
    field("GEOIP_COUNTRY_CODE", &["country", "iso_code"]),
    field("GEOIP_COUNTRY_NAME", &["country", "names", "en"]),
    field("GEOIP_REGISTERED_COUNTRY_CODE", &["registered_country", "iso_code"]),
    field("GEOIP_REGISTERED_COUNTRY_NAME", &["registered_country", "names", "en"]),
    field("GEOIP_REGION_CODE", &["subdivisions", "0", "iso_code"]),
    field("GEOIP_REGION_NAME", &["subdivisions", "0", "names", "en"]),
    field("GEOIP_CITY", &["city", "names", "en"]),
    field("GEOIP_POSTAL_CODE", &["postal", "code"]),
];

/// Look up `client_ip` and produce the variables to bind for it.
///
/// `db` is `None` when the scope's database could not be opened. The output
/// is ordered: the address variable, the well-known fields, then the custom
/// bindings in declaration order. Applying it front to back lets a later
/// entry overwrite an earlier one with the same name.
///
/// The scope must be enabled and carry a database path; anything else is a
/// caller bug and yields no variables.
pub fn extract(
    scope: &ScopeConfig,
    client_ip: &str,
    db: Option<&dyn GeoDatabase>,
) -> Vec<OutputVariable> {
    debug_assert!(scope.enabled, "extract called with a disabled scope");
    if scope.active_database().is_none() {
        return Vec::new();
    }

    let mut out = vec![OutputVariable::new(ADDR_VARIABLE, client_ip)];

    let Some(db) = db else {
        return out;
    };
    let key = match address::normalize(client_ip) {
        Ok(key) => key,
        Err(err) => {
            debug!("{err}");
            return out;
        }
    };
    let entry = match db.lookup(key) {
        Ok(Some(entry)) => entry,
        Ok(None) => return out,
        Err(err) => {
            debug!("{:#}", anyhow::Error::new(err));
            return out;
        }
    };

    bind_fields(scope, &entry, &mut out);
    out
}

fn bind_fields(scope: &ScopeConfig, entry: &LocatedEntry, out: &mut Vec<OutputVariable>) {
    for field in WELL_KNOWN_FIELDS {
        if let Some(value) = entry.resolve(field.path).render() {
            out.push(OutputVariable::new(field.variable, value));
        }
    }
    for binding in &scope.bindings {
        if let Some(value) = entry.get(&binding.path).render() {
            out.push(OutputVariable::new(binding.variable.as_str(), value));
        }
    }
}
