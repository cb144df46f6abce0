// Error classes callers need to tell apart
//
// Everything fallible returns anyhow::Result. The variants below ride inside
// anyhow::Error and are recovered with `downcast_ref::<GfxError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GfxError {
    /// No adapter offers graphics + present queues, the required extensions,
    /// and at least one surface format and present mode.
    #[error("No suitable GPU found which meets the application requirements")]
    NoSuitableAdapter,

    #[error("Required extensions not present: {}", .0.join(", "))]
    MissingExtensions(Vec<String>),

    #[error("Required layers not present: {}", .0.join(", "))]
    MissingLayers(Vec<String>),

    /// A fence wait or image acquire ran past its timeout.
    #[error("Timed out waiting on the GPU")]
    Timeout,

    #[error("Image index {index} out of range (image count {count})")]
    ImageIndexOutOfRange { index: u32, count: u32 },

    #[error("Present requested for image {image} which was not acquired")]
    PresentWithoutAcquire { image: u32 },

    #[error("Subpass {subpass} references attachment {attachment}, but only {count} exist")]
    InvalidAttachment {
        subpass: usize,
        attachment: u32,
        count: usize,
    },

    #[error("Subpass {index} does not exist (subpass count {count})")]
    InvalidSubpass { index: usize, count: usize },
}

impl GfxError {
    /// Check whether an anyhow error carries this exact class.
    pub fn matches(err: &anyhow::Error, pred: impl Fn(&GfxError) -> bool) -> bool {
        err.downcast_ref::<GfxError>().is_some_and(pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_context() {
        let err = anyhow::Error::new(GfxError::Timeout).context("Waiting on frame fence");
        assert!(GfxError::matches(&err, |e| matches!(e, GfxError::Timeout)));
        assert!(!GfxError::matches(&err, |e| matches!(e, GfxError::NoSuitableAdapter)));
    }

    #[test]
    fn test_missing_extensions_message_lists_names() {
        let err = GfxError::MissingExtensions(vec!["VK_KHR_swapchain".into(), "VK_EXT_foo".into()]);
        assert_eq!(
            err.to_string(),
            "Required extensions not present: VK_KHR_swapchain, VK_EXT_foo"
        );
    }
}
