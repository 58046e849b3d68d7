//! GeoIP lookup interface.

use std::net::Ipv4Addr;

/// Country lookup for geo-blocking. `None` means the database has no record
/// for the address.
pub trait GeoIp: Send + Sync {
    fn country(&self, ip: Ipv4Addr) -> Option<String>;
}

/// Lookup that knows nothing. Geo-blocking degrades per the `geopanic` knob.
#[derive(Debug, Default)]
pub struct NoGeoIp;

impl GeoIp for NoGeoIp {
    fn country(&self, _ip: Ipv4Addr) -> Option<String> {
        None
    }
}
