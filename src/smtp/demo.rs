use crate::smtp::{codes, Mailer, SenderError};

/// Pretends to deliver everything, except to recipients whose address
/// contains "error", which fail transiently. For tests and local runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DemoMailer;

impl Mailer for DemoMailer {
    fn send(&self, _from: &str, to: &str, body: &[u8]) -> Result<(), SenderError> {
        if to.contains("error") {
            info!("(demo) simulating failure for {}", to);
            return Err(SenderError::transient(codes::CONNECT, "simulated delivery failure"));
        }
        info!("(demo) pretending to deliver {} bytes to {}", body.len(), to);
        Ok(())
    }
}
