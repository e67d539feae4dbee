//! Gateway seam: services with a public domain get their backend set
//! rewritten on promote. Real nginx/DNS automation lives outside this crate;
//! this default implementation only records the intent.

use async_trait::async_trait;
use flotilla_core::error::FlotillaResult;
use flotilla_core::ops::Gateway;
use flotilla_core::types::ServiceId;
use tracing::info;

pub struct LogGateway;

#[async_trait]
impl Gateway for LogGateway {
    async fn update_backends(
        &self,
        service: &ServiceId,
        domain: &str,
        backend_ips: &[String],
    ) -> FlotillaResult<()> {
        info!(
            "gateway: {} ({}) now backed by {:?}",
            domain, service, backend_ips
        );
        Ok(())
    }
}
