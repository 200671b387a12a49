//! Text subtitle extraction to WebVTT.

use std::{fmt::Write as _, path::Path};

use ffmpeg_next::{Rational, Rescale, codec::subtitle, util::mathematics::rescale::TIME_BASE};
use tokio_util::sync::CancellationToken;

use crate::input::AvInput;

/// One subtitle cue in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

/// Bitmap subtitle codecs cannot be turned into text.
pub fn is_bitmap_subtitle(codec: &str) -> bool {
    matches!(
        codec,
        "hdmv_pgs_subtitle" | "pgssub" | "dvd_subtitle" | "dvdsub" | "dvb_subtitle" | "dvbsub" | "xsub"
    )
}

/// `HH:MM:SS.mmm`
pub fn format_timestamp(ms: i64) -> String {
    let ms = ms.max(0);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// Reduces an ASS event line (`ReadOrder,Layer,Style,Name,MarginL,MarginR,MarginV,Effect,Text`,
/// optionally prefixed with `Dialogue:`) to plain text.
pub fn ass_to_text(line: &str) -> String {
    let (body, fields) = match line.strip_prefix("Dialogue:") {
        Some(rest) => (rest.trim_start(), 9),
        None => (line, 8),
    };
    let text = body.splitn(fields + 1, ',').nth(fields).unwrap_or(body);

    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => in_tag = true,
            '}' if in_tag => in_tag = false,
            _ if in_tag => {}
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('h') => {
                    chars.next();
                    out.push(' ');
                }
                _ => out.push('\\'),
            },
            _ => out.push(c),
        }
    }
    out.trim().to_string()
}

pub fn render_webvtt(cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for cue in cues {
        let _ = write!(
            out,
            "{} --> {}\n{}\n\n",
            format_timestamp(cue.start_ms),
            format_timestamp(cue.end_ms),
            cue.text
        );
    }
    out
}

/// Decodes subtitle stream `stream_index` of `input` and writes it to `output` as WebVTT.
/// The file appears atomically. Returns the number of cues written.
pub fn extract_webvtt(
    input: &Path,
    stream_index: usize,
    output: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<usize> {
    let mut av_input = AvInput::open(input, cancel)?;
    let stream = av_input
        .stream(stream_index)
        .filter(|s| s.is_subtitle())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("stream {} is not a subtitle stream", stream_index))?;

    let mut decoder_ctx = ffmpeg_next::codec::Context::new();
    decoder_ctx.set_parameters(stream.parameters().clone())?;
    unsafe {
        (*decoder_ctx.as_mut_ptr()).pkt_timebase = stream.time_base().into();
    }
    let mut decoder = decoder_ctx.decoder().subtitle()?;
    let millis = Rational::new(1, 1000);

    let mut cues = Vec::new();
    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("subtitle extraction cancelled");
        }
        let Some(packet) = av_input.read_packet()? else {
            break;
        };
        if packet.stream() != stream_index {
            continue;
        }

        let mut decoded = subtitle::Subtitle::new();
        if !decoder.decode(&packet, &mut decoded)? {
            continue;
        }

        let base_ms = match decoded.pts() {
            Some(pts) => pts.rescale(TIME_BASE, millis),
            None => packet
                .pts()
                .map(|pts| pts.rescale(stream.time_base(), millis))
                .unwrap_or(0),
        };
        let start_ms = base_ms + decoded.start() as i64;
        let mut end_ms = base_ms + decoded.end() as i64;
        if end_ms <= start_ms {
            end_ms = start_ms + packet.duration().rescale(stream.time_base(), millis).max(1);
        }

        let text = decoded
            .rects()
            .filter_map(|rect| match rect {
                subtitle::Rect::Text(text) => Some(text.get().trim().to_string()),
                subtitle::Rect::Ass(ass) => Some(ass_to_text(ass.get())),
                _ => None,
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            cues.push(Cue {
                start_ms,
                end_ms,
                text,
            });
        }
    }

    let tmp = output.with_extension("vtt.tmp");
    std::fs::write(&tmp, render_webvtt(&cues))?;
    std::fs::rename(&tmp, output)?;
    log::debug!(
        "extracted {} cues from stream {} to {}",
        cues.len(),
        stream_index,
        output.display()
    );
    Ok(cues.len())
}
