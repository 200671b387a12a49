//! Codec-parameter side data that must not reach the muxer.
//!
//! ffmpeg-next does not expose `AVCodecParameters::coded_side_data`, so removal
//! goes through the raw FFmpeg API here and nowhere else.

use ffmpeg_next::{codec::Parameters, ffi};

/// Side-data record kinds this crate knows how to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideDataKind {
    /// Dolby Vision decoder configuration record (`dvcC`/`dvvC`).
    DolbyVisionConfig,
}

impl SideDataKind {
    fn as_ffi(self) -> ffi::AVPacketSideDataType {
        match self {
            Self::DolbyVisionConfig => ffi::AVPacketSideDataType::AV_PKT_DATA_DOVI_CONF,
        }
    }
}

/// Returns true if `params` carries a record of `kind`.
pub fn has_side_data(params: &Parameters, kind: SideDataKind) -> bool {
    unsafe {
        let ptr = params.as_ptr();
        let entries = (*ptr).coded_side_data;
        let count = (*ptr).nb_coded_side_data.max(0) as usize;
        if entries.is_null() {
            return false;
        }
        (0..count).any(|i| (*entries.add(i)).type_ == kind.as_ffi())
    }
}

/// Removes every record of `kind` from `params`. Returns true if anything was removed.
///
/// Must run before the output header is written: muxers pick container brands
/// from this side data when the header goes out.
pub fn strip_side_data(params: &mut Parameters, kind: SideDataKind) -> bool {
    if !has_side_data(params, kind) {
        return false;
    }
    unsafe {
        let ptr = params.as_mut_ptr();
        ffi::av_packet_side_data_remove(
            (*ptr).coded_side_data,
            &mut (*ptr).nb_coded_side_data,
            kind.as_ffi(),
        );
    }
    true
}
