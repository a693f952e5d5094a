// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Assembles the legacy binary replay container for a finished play:
//! length-prefixed strings, compact hit counts, an LZMA frame stream and
//! an LZMA-compressed score-info trailer.

use crate::db::scores::ScoreRow;
use cadence_common::mods::{legacy_mods_bitmask, ApiMod, Statistics};
use cadence_common::protocol::WireValue;
use cadence_common::spectator::LegacyReplayFrame;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};

const REPLAY_VERSION: i32 = 30000016;

/// Seconds between 0001-01-01 and the Unix epoch.
const WINDOWS_EPOCH_OFFSET_SECS: i64 = 62_135_596_800;

fn encode_uleb128(mut value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }
    let mut out = Vec::new();
    while value != 0 {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

/// Strings are either a 0x00 byte (empty) or 0x0b + ULEB128 length +
/// UTF-8 bytes.
fn encode_string(s: &str) -> Vec<u8> {
    if s.is_empty() {
        return vec![0];
    }
    let mut out = vec![0x0b];
    out.extend_from_slice(&encode_uleb128(s.len() as u64));
    out.extend_from_slice(s.as_bytes());
    out
}

fn windows_ticks(unix_secs: i64) -> i64 {
    (unix_secs + WINDOWS_EPOCH_OFFSET_SECS) * 10_000_000
}

fn lzma_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    lzma_rs::lzma_compress(&mut &data[..], &mut out)?;
    Ok(out)
}

/// Frames are relative-time text records terminated by the classic
/// `-12345|0|0|0` sentinel.
fn frame_stream(frames: &[LegacyReplayFrame]) -> String {
    let mut parts = Vec::with_capacity(frames.len() + 1);
    let mut last_time = 0;
    for frame in frames {
        parts.push(format!(
            "{}|{}|{}|{}",
            frame.time - last_time,
            frame.x.unwrap_or(0.0),
            frame.y.unwrap_or(0.0),
            frame.button_state.0,
        ));
        last_time = frame.time;
    }
    parts.push("-12345|0|0|0".to_owned());
    parts.join(",")
}

fn statistics_json(statistics: &Statistics) -> serde_json::Value {
    serde_json::Value::Object(
        statistics
            .iter()
            .map(|(hit, count)| (hit.as_str().to_owned(), json!(count)))
            .collect(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn encode_replay(
    ruleset_id: i32,
    beatmap_md5: &str,
    username: &str,
    score: &ScoreRow,
    mods: &[ApiMod],
    statistics: &Statistics,
    maximum_statistics: &Statistics,
    frames: &[LegacyReplayFrame],
) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    data.push(ruleset_id as u8);
    data.extend_from_slice(&REPLAY_VERSION.to_le_bytes());
    data.extend_from_slice(&encode_string(beatmap_md5));
    data.extend_from_slice(&encode_string(username));
    data.extend_from_slice(&encode_string(&format!(
        "lazer-{username}-{}",
        score.started_at.to_rfc3339()
    )));
    for count in [
        score.n300, score.n100, score.n50, score.ngeki, score.nkatu, score.nmiss,
    ] {
        data.extend_from_slice(&(count as i16).to_le_bytes());
    }
    data.extend_from_slice(&(score.total_score as i32).to_le_bytes());
    data.extend_from_slice(&(score.max_combo as i16).to_le_bytes());
    data.push(score.is_perfect_combo as u8);
    data.extend_from_slice(&legacy_mods_bitmask(mods).to_le_bytes());
    // Empty HP graph.
    data.extend_from_slice(&encode_string(""));
    data.extend_from_slice(&windows_ticks(score.started_at.timestamp()).to_le_bytes());

    let compressed_frames = lzma_compress(frame_stream(frames).as_bytes())?;
    data.extend_from_slice(&(compressed_frames.len() as i32).to_le_bytes());
    data.extend_from_slice(&compressed_frames);

    data.extend_from_slice(&score.id.to_le_bytes());

    let score_info = json!({
        "online_id": score.id,
        "mods": mods.iter().map(WireValue::to_json).collect::<Vec<_>>(),
        "statistics": statistics_json(statistics),
        "maximum_statistics": statistics_json(maximum_statistics),
        "client_version": "",
        "rank": score.rank,
        "user_id": score.user_id,
        "total_score_without_mods": score.total_score_without_mods,
    });
    let compressed_info = lzma_compress(score_info.to_string().as_bytes())?;
    data.extend_from_slice(&(compressed_info.len() as i32).to_le_bytes());
    data.extend_from_slice(&compressed_info);

    Ok(data)
}

#[allow(clippy::too_many_arguments)]
pub fn save_replay(
    replay_dir: &Path,
    ruleset_id: i32,
    beatmap_md5: &str,
    username: &str,
    score: &ScoreRow,
    mods: &[ApiMod],
    statistics: &Statistics,
    maximum_statistics: &Statistics,
    frames: &[LegacyReplayFrame],
) -> io::Result<PathBuf> {
    let data = encode_replay(
        ruleset_id,
        beatmap_md5,
        username,
        score,
        mods,
        statistics,
        maximum_statistics,
        frames,
    )?;
    std::fs::create_dir_all(replay_dir)?;
    let path = replay_dir.join(format!(
        "lazer-{}-{username}-{}.osr",
        score.score_type, score.id
    ));
    std::fs::write(&path, data)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::mods::HitResult;
    use cadence_common::spectator::ReplayButtonState;
    use chrono::{TimeZone, Utc};

    fn sample_score() -> ScoreRow {
        ScoreRow {
            id: 4242,
            user_id: 1001,
            beatmap_id: 842,
            passed: true,
            rank: "S".to_owned(),
            total_score: 987_654,
            total_score_without_mods: 900_000,
            max_combo: 512,
            is_perfect_combo: false,
            n300: 300,
            n100: 12,
            n50: 1,
            ngeki: 40,
            nkatu: 3,
            nmiss: 2,
            pp: 123.4,
            started_at: Utc.timestamp_opt(1_720_000_000, 0).unwrap(),
            score_type: "solo_score".to_owned(),
            room_id: None,
            playlist_item_id: None,
        }
    }

    #[test]
    fn uleb128_and_strings() {
        assert_eq!(encode_uleb128(0), vec![0]);
        assert_eq!(encode_uleb128(127), vec![0x7f]);
        assert_eq!(encode_uleb128(128), vec![0x80, 0x01]);
        assert_eq!(encode_string(""), vec![0]);
        let encoded = encode_string("ab");
        assert_eq!(encoded, vec![0x0b, 2, b'a', b'b']);
    }

    #[test]
    fn windows_ticks_epoch() {
        // 1970-01-01 in .NET ticks.
        assert_eq!(windows_ticks(0), 621_355_968_000_000_000);
    }

    #[test]
    fn frame_stream_is_relative_and_terminated() {
        let frames = vec![
            LegacyReplayFrame {
                time: 100,
                x: Some(1.5),
                y: Some(2.0),
                button_state: ReplayButtonState::LEFT1,
            },
            LegacyReplayFrame {
                time: 150,
                x: None,
                y: None,
                button_state: ReplayButtonState::NONE,
            },
        ];
        let stream = frame_stream(&frames);
        assert_eq!(stream, "100|1.5|2|1,50|0|0|0,-12345|0|0|0");
    }

    #[test]
    fn replay_header_layout() {
        let score = sample_score();
        let mut statistics = Statistics::new();
        statistics.insert(HitResult::Great, 300);
        let data = encode_replay(
            0,
            "d41d8cd98f00b204e9800998ecf8427e",
            "alice",
            &score,
            &[],
            &statistics,
            &statistics,
            &[],
        )
        .unwrap();
        // Ruleset byte then version.
        assert_eq!(data[0], 0);
        assert_eq!(i32::from_le_bytes(data[1..5].try_into().unwrap()), REPLAY_VERSION);
        // First string marker + md5 length.
        assert_eq!(data[5], 0x0b);
        assert_eq!(data[6], 32);
        assert_eq!(&data[7..39], b"d41d8cd98f00b204e9800998ecf8427e");
    }
}
