//! Video format tables: pixel groups, frame-rate timing, packing modes and
//! the lookup tables used by the format detector.

/// RTP video sampling clock, Hz. Fixed at 90 kHz for ST 2110 video.
pub const VIDEO_SAMPLING_CLOCK_HZ: u32 = 90_000;

/// Uncompressed pixel format on the wire (ST 2110-20 / RFC 4175).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YCbCr 4:2:2 10-bit, 5 bytes per 2 pixels. The broadcast workhorse.
    Yuv422p10,
    /// YCbCr 4:2:2 8-bit, 4 bytes per 2 pixels.
    Yuv422p8,
    /// YCbCr 4:2:2 12-bit, 6 bytes per 2 pixels.
    Yuv422p12,
    /// YCbCr 4:4:4 10-bit, 15 bytes per 4 pixels.
    Yuv444p10,
    /// YCbCr 4:2:0 8-bit, 6 bytes per 4 pixels.
    Yuv420p8,
    /// RGB 8-bit, 3 bytes per pixel.
    Rgb8,
    /// RGB 10-bit, 15 bytes per 4 pixels.
    Rgb10,
}

/// Pixel group: the smallest addressable unit of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelGroup {
    /// Bytes per group.
    pub size: u32,
    /// Pixels covered by one group.
    pub coverage: u32,
}

impl PixelFormat {
    pub fn pixel_group(&self) -> PixelGroup {
        match self {
            PixelFormat::Yuv422p10 => PixelGroup { size: 5, coverage: 2 },
            PixelFormat::Yuv422p8 => PixelGroup { size: 4, coverage: 2 },
            PixelFormat::Yuv422p12 => PixelGroup { size: 6, coverage: 2 },
            PixelFormat::Yuv444p10 => PixelGroup { size: 15, coverage: 4 },
            PixelFormat::Yuv420p8 => PixelGroup { size: 6, coverage: 4 },
            PixelFormat::Rgb8 => PixelGroup { size: 3, coverage: 1 },
            PixelFormat::Rgb10 => PixelGroup { size: 15, coverage: 4 },
        }
    }
}

/// Frame rate. Fractional rates carry the 1001 denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fps {
    P23_98,
    P24,
    P25,
    P29_97,
    P30,
    P50,
    P59_94,
    P60,
    P100,
    P119_88,
    P120,
}

/// Timing for one frame rate: `rate = mul / den` frames per second.
#[derive(Debug, Clone, Copy)]
pub struct FpsTiming {
    pub mul: u32,
    pub den: u32,
    /// RTP sampling clock rate, Hz.
    pub sampling_clock_rate: u32,
}

impl Fps {
    pub fn timing(&self) -> FpsTiming {
        let (mul, den) = match self {
            Fps::P23_98 => (24_000, 1001),
            Fps::P24 => (24, 1),
            Fps::P25 => (25, 1),
            Fps::P29_97 => (30_000, 1001),
            Fps::P30 => (30, 1),
            Fps::P50 => (50, 1),
            Fps::P59_94 => (60_000, 1001),
            Fps::P60 => (60, 1),
            Fps::P100 => (100, 1),
            Fps::P119_88 => (120_000, 1001),
            Fps::P120 => (120, 1),
        };
        FpsTiming { mul, den, sampling_clock_rate: VIDEO_SAMPLING_CLOCK_HZ }
    }

    /// Frames per second as a float (59.94..., not 60).
    pub fn rate(&self) -> f64 {
        let t = self.timing();
        t.mul as f64 / t.den as f64
    }

    /// Nominal frame duration in nanoseconds.
    pub fn frame_time_ns(&self) -> f64 {
        let t = self.timing();
        1_000_000_000.0 * t.den as f64 / t.mul as f64
    }

    /// RTP timestamp ticks per frame (e.g. 1500 at 60 fps).
    pub fn frame_time_sampling(&self) -> f64 {
        let t = self.timing();
        t.sampling_clock_rate as f64 * t.den as f64 / t.mul as f64
    }
}

/// RFC 4175 packing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Block Packing Mode: payload a multiple of 180 bytes.
    Bpm,
    /// General Packing Mode.
    Gpm,
    /// General Packing Mode, single line per packet.
    GpmSl,
}

/// Detector: frame rate from the RTP timestamp delta between two markers.
pub fn fps_from_rtp_delta(delta: i64) -> Option<Fps> {
    match delta {
        1500 => Some(Fps::P60),
        1501 | 1502 => Some(Fps::P59_94),
        3000 => Some(Fps::P30),
        3003 => Some(Fps::P29_97),
        3600 => Some(Fps::P25),
        1800 => Some(Fps::P50),
        _ => None,
    }
}

/// Detector: resolution from the highest SRD row number seen at a marker.
/// Interlaced streams number rows per field, so the tables differ.
pub fn dimension_from_max_line(max_line: u16, interlaced: bool) -> Option<(u32, u32)> {
    if interlaced {
        match max_line {
            239 => Some((640, 480)),
            359 => Some((1280, 720)),
            539 => Some((1920, 1080)),
            1079 => Some((3840, 2160)),
            2159 => Some((7680, 4320)),
            _ => None,
        }
    } else {
        match max_line {
            479 => Some((640, 480)),
            719 => Some((1280, 720)),
            1079 => Some((1920, 1080)),
            2159 => Some((3840, 2160)),
            4319 => Some((7680, 4320)),
            _ => None,
        }
    }
}

/// Raw payload bandwidth of a stream in bits per second. Used only to decide
/// whether a session rates a dedicated packet-handler thread.
pub fn bandwidth_bps(
    width: u32,
    height: u32,
    fmt: PixelFormat,
    fps: Fps,
    interlaced: bool,
) -> u64 {
    let pg = fmt.pixel_group();
    let mut frame_bytes = width as u64 * height as u64 * pg.size as u64 / pg.coverage as u64;
    if interlaced {
        frame_bytes /= 2;
    }
    (frame_bytes as f64 * fps.rate() * 8.0) as u64
}
