use std::fmt;

/// Identifier of the logical view on the remote renderer.
///
/// Remote view ids are non-negative. A coordinator starts with
/// `ViewId::UNSET` and skips fetching until it is given a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(i64);

impl ViewId {
    pub const UNSET: ViewId = ViewId(-1);

    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl Default for ViewId {
    fn default() -> Self {
        Self::UNSET
    }
}

/// Render quality requested from the remote service, 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RenderQuality(u8);

impl RenderQuality {
    pub const MAX: RenderQuality = RenderQuality(100);

    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX.0))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for RenderQuality {
    fn default() -> Self {
        Self::MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub view_id: ViewId,
    pub quality: RenderQuality,
    pub width: u32,
    pub height: u32,
}

impl RenderRequest {
    pub fn for_surface(view_id: ViewId, quality: RenderQuality, size: SurfaceSize) -> Self {
        Self {
            view_id,
            quality,
            width: size.width,
            height: size.height,
        }
    }

    pub fn size(&self) -> SurfaceSize {
        SurfaceSize::new(self.width, self.height)
    }
}

/// One completed render from the remote service: the encoded image bytes
/// and the server's own verdict on whether that image is already out of
/// date. A stale response must trigger a follow-up fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResponse {
    pub payload: Vec<u8>,
    pub server_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderServiceError {
    RemoteCall { message: String },
    MalformedResponse { message: String },
}

impl fmt::Display for RenderServiceError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderServiceError::RemoteCall { message } => {
                write!(formatter, "remote render call failed: {message}")
            }
            RenderServiceError::MalformedResponse { message } => {
                write!(formatter, "remote render response malformed: {message}")
            }
        }
    }
}

impl std::error::Error for RenderServiceError {}

/// Connection to the remote rendering service.
///
/// `render` blocks until the remote call completes and is only ever
/// invoked from a fetch worker thread, never from the presentation
/// thread. Implementations must be callable from any thread.
pub trait RenderClient: Send + Sync {
    fn render(&self, request: RenderRequest) -> Result<RenderResponse, RenderServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_view_id_is_not_valid() {
        assert!(!ViewId::UNSET.is_valid());
        assert!(!ViewId::new(-7).is_valid());
        assert!(ViewId::new(0).is_valid());
        assert!(ViewId::new(3).is_valid());
        assert_eq!(ViewId::default(), ViewId::UNSET);
    }

    #[test]
    fn quality_clamps_to_maximum() {
        assert_eq!(RenderQuality::new(250).value(), 100);
        assert_eq!(RenderQuality::new(35).value(), 35);
        assert_eq!(RenderQuality::default(), RenderQuality::MAX);
    }

    #[test]
    fn surface_size_is_empty_when_either_dimension_is_zero() {
        assert!(SurfaceSize::new(0, 600).is_empty());
        assert!(SurfaceSize::new(800, 0).is_empty());
        assert!(SurfaceSize::new(0, 0).is_empty());
        assert!(!SurfaceSize::new(800, 600).is_empty());
    }

    #[test]
    fn request_for_surface_carries_size_and_quality() {
        let request = RenderRequest::for_surface(
            ViewId::new(3),
            RenderQuality::MAX,
            SurfaceSize::new(800, 600),
        );
        assert_eq!(request.view_id, ViewId::new(3));
        assert_eq!(request.quality.value(), 100);
        assert_eq!(request.width, 800);
        assert_eq!(request.height, 600);
        assert_eq!(request.size(), SurfaceSize::new(800, 600));
    }
}
