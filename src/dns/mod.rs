//! Host name resolution for the connect job.
//!
//! [`Resolve`] is the seam: [`GaiResolver`] asks the operating system,
//! [`DnsResolverWithOverrides`] pins selected hosts to fixed addresses
//! (handy for tests and local development) and delegates the rest.

mod gai;
mod resolve;

pub use gai::GaiResolver;
pub use resolve::{resolve_host, Addrs, DnsResolverWithOverrides, Name, Resolve, Resolving};
