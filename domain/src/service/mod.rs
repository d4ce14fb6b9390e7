mod drm_adapter;

#[cfg(feature = "mock")]
pub use self::drm_adapter::MockDrmAdapter;
pub use self::drm_adapter::DrmAdapter;
