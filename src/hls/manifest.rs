//! HLS media playlists and MPEG-DASH manifests over the same segments

use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};

use super::segmenter::SegmentWindow;

/// Segment URI relative to the manifest
pub fn segment_uri(session: &str, sequence: u64) -> String {
    format!("{}/{}.ts", session, sequence)
}

/// Live media playlist (no ENDLIST)
pub fn media_playlist(session: &str, window: &SegmentWindow) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:3");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", window.target_duration_secs());
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", window.first_sequence());
    for segment in window.segments() {
        let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration.as_secs_f64());
        let _ = writeln!(out, "{}", segment_uri(session, segment.sequence));
    }
    out
}

fn iso_duration(secs: f64) -> String {
    format!("PT{:.3}S", secs)
}

/// Dynamic MPD listing the window with an explicit timeline
pub fn dash_manifest(
    session: &str,
    window: &SegmentWindow,
    codecs: &str,
    available_since: DateTime<Utc>,
) -> String {
    let target = window.target().as_secs_f64().max(1.0);
    let depth: f64 = window.segments().map(|s| s.duration.as_secs_f64()).sum();
    let bytes: usize = window.segments().map(|s| s.data.len()).sum();
    let bandwidth = if depth > 0.0 {
        (bytes as f64 * 8.0 / depth) as u64
    } else {
        0
    };
    // A segment is published when it ends
    let mut start_ms = window
        .segments()
        .next()
        .map(|s| {
            let ended = (s.published - available_since).num_milliseconds().max(0) as u64;
            ended.saturating_sub(s.duration.as_millis() as u64)
        })
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = writeln!(
        out,
        r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" profiles="urn:mpeg:dash:profile:mp2t-simple:2011" availabilityStartTime="{}" publishTime="{}" minimumUpdatePeriod="{}" minBufferTime="{}" timeShiftBufferDepth="{}">"#,
        available_since.to_rfc3339_opts(SecondsFormat::Secs, true),
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        iso_duration(target),
        iso_duration(target),
        iso_duration(depth.max(target)),
    );
    let _ = writeln!(out, r#"  <Period id="0" start="PT0S">"#);
    let _ = writeln!(
        out,
        r#"    <AdaptationSet mimeType="video/mp2t" segmentAlignment="true">"#
    );
    let _ = writeln!(
        out,
        r#"      <Representation id="{}" bandwidth="{}" codecs="{}">"#,
        session, bandwidth, codecs
    );
    let _ = writeln!(
        out,
        r#"        <SegmentList timescale="1000" startNumber="{}">"#,
        window.first_sequence()
    );
    let _ = writeln!(out, "          <SegmentTimeline>");
    for segment in window.segments() {
        let duration = segment.duration.as_millis() as u64;
        let _ = writeln!(out, r#"            <S t="{}" d="{}"/>"#, start_ms, duration);
        start_ms += duration;
    }
    let _ = writeln!(out, "          </SegmentTimeline>");
    for segment in window.segments() {
        let _ = writeln!(
            out,
            r#"          <SegmentURL media="{}"/>"#,
            segment_uri(session, segment.sequence)
        );
    }
    let _ = writeln!(out, "        </SegmentList>");
    let _ = writeln!(out, "      </Representation>");
    let _ = writeln!(out, "    </AdaptationSet>");
    let _ = writeln!(out, "  </Period>");
    let _ = writeln!(out, "</MPD>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::segmenter::Segment;
    use bytes::Bytes;
    use std::time::Duration;

    fn window() -> SegmentWindow {
        let mut window = SegmentWindow::new(Duration::from_secs(2), 5);
        for sequence in 3..5 {
            window.push(Segment {
                sequence,
                duration: Duration::from_millis(2040),
                data: Bytes::from_static(&[0u8; 188]),
                published: Utc::now(),
            });
        }
        window
    }

    #[test]
    fn playlist_lists_window() {
        let text = media_playlist("ts", &window());
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:3\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:3\n"));
        assert!(text.contains("#EXTINF:2.040,\nts/3.ts\n"));
        assert!(text.contains("ts/4.ts"));
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn empty_playlist_uses_configured_target() {
        let window = SegmentWindow::new(Duration::from_secs(4), 5);
        let text = media_playlist("ts", &window);
        assert!(text.contains("#EXT-X-TARGETDURATION:4\n"));
        assert!(!text.contains("#EXTINF"));
    }

    #[test]
    fn mpd_lists_segment_urls() {
        let text = dash_manifest("ts", &window(), "avc1.42e01f", Utc::now());
        assert!(text.contains(r#"type="dynamic""#));
        assert!(text.contains(r#"codecs="avc1.42e01f""#));
        assert!(text.contains(r#"startNumber="3""#));
        assert!(text.contains(r#"<SegmentURL media="ts/3.ts"/>"#));
        assert_eq!(text.matches("<S ").count(), 2);
    }
}
