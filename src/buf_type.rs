ffi_enum! {
    /// A buffer or stream type.
    pub enum BufType: u32 { // more of a "stream type", really
        /// Single-plane video capture.
        VIDEO_CAPTURE = 1,
        /// Single-plane video output.
        VIDEO_OUTPUT = 2,
        /// Multi-plane video capture; a codec device produces its decoded
        /// frames or encoded bitstream here.
        VIDEO_CAPTURE_MPLANE = 9,
        /// Multi-plane video output; a codec device consumes its compressed
        /// bitstream or raw frames here.
        VIDEO_OUTPUT_MPLANE = 10,
    }
}

impl BufType {
    /// Whether this is an OUTPUT-direction queue (application to driver).
    pub fn is_output(self) -> bool {
        matches!(self, Self::VIDEO_OUTPUT | Self::VIDEO_OUTPUT_MPLANE)
    }

    pub fn is_multiplanar(self) -> bool {
        matches!(self, Self::VIDEO_CAPTURE_MPLANE | Self::VIDEO_OUTPUT_MPLANE)
    }

    /// The single-planar buffer type addressing the same direction.
    ///
    /// Selection rectangles are defined on the single-planar types even for
    /// multi-planar queues.
    pub fn single_planar_equivalent(self) -> BufType {
        match self {
            Self::VIDEO_CAPTURE_MPLANE => Self::VIDEO_CAPTURE,
            Self::VIDEO_OUTPUT_MPLANE => Self::VIDEO_OUTPUT,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction() {
        assert!(BufType::VIDEO_OUTPUT_MPLANE.is_output());
        assert!(!BufType::VIDEO_CAPTURE_MPLANE.is_output());
    }

    #[test]
    fn selection_types() {
        assert_eq!(
            BufType::VIDEO_CAPTURE_MPLANE.single_planar_equivalent(),
            BufType::VIDEO_CAPTURE
        );
        assert_eq!(
            BufType::VIDEO_OUTPUT_MPLANE.single_planar_equivalent(),
            BufType::VIDEO_OUTPUT
        );
        assert_eq!(
            BufType::VIDEO_CAPTURE.single_planar_equivalent(),
            BufType::VIDEO_CAPTURE
        );
    }
}
