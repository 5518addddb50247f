pub mod breach;
pub mod dns;
pub mod geoip;
pub mod subdomains;
pub mod wallet;
pub mod whois;
