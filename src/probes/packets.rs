use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::command::run_command;
use super::{ProbeDetail, ProbeKind, ProbeResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PacketDetail {
    pub file: String,
    pub total_packets: u64,
    pub retransmissions: u64,
    pub out_of_order: u64,
    pub lost_segments: u64,
    pub duplicate_acks: u64,
    pub retransmission_rate_percent: f64,
}

/// Decodes a capture file and counts TCP trouble markers. The
/// retransmission rate is the numeric value.
pub async fn run(decoder: &str, file: &Path, limit: Duration) -> ProbeResult {
    let file_text = file.display().to_string();
    let target = Some(file_text.clone());

    if let Err(err) = tokio::fs::metadata(file).await {
        return ProbeResult::failure(
            ProbeKind::PacketAnalysis,
            target,
            format!("capture file {file_text} unreadable: {err}"),
        );
    }

    let output = match run_command(
        decoder,
        &[
            "-r",
            &file_text,
            "-n",
            "-T",
            "fields",
            "-E",
            "separator=/t",
            "-e",
            "frame.number",
            "-e",
            "_ws.col.Info",
        ],
        limit,
    )
    .await
    {
        Ok(output) => output,
        Err(err) => {
            warn!(decoder, error = %err, "packet decoder failed");
            return err.into_result(
                ProbeKind::PacketAnalysis,
                target,
                "install tshark (wireshark-cli) to decode captures",
            );
        }
    };

    // A capture still being written ends mid-packet; the decoder exits
    // non-zero but the rows it printed are valid.
    if !output.success() {
        if output.stdout.trim().is_empty() {
            return ProbeResult::failure(
                ProbeKind::PacketAnalysis,
                target,
                output.error_summary(),
            );
        }
        debug!(file = %file_text, exit_code = output.exit_code, "decoder exited early, using partial output");
    }

    let mut detail = tally_markers(&output.stdout);
    detail.file = file_text;
    let rate = detail.retransmission_rate_percent;
    ProbeResult::success(
        ProbeKind::PacketAnalysis,
        target,
        Some(rate),
        ProbeDetail::PacketAnalysis(detail),
    )
}

/// Counts expert markers in `frame.number<TAB>info` rows.
pub fn tally_markers(stdout: &str) -> PacketDetail {
    let mut detail = PacketDetail::default();
    for line in stdout.lines() {
        let mut fields = line.splitn(2, '\t');
        let Some(frame) = fields.next() else {
            continue;
        };
        if frame.trim().parse::<u64>().is_err() {
            continue;
        }
        detail.total_packets += 1;

        let info = fields.next().unwrap_or("");
        if info.contains("[TCP Retransmission]") || info.contains("[TCP Fast Retransmission]") {
            detail.retransmissions += 1;
        }
        if info.contains("[TCP Out-Of-Order]") {
            detail.out_of_order += 1;
        }
        if info.contains("[TCP Previous segment not captured]") {
            detail.lost_segments += 1;
        }
        if info.contains("[TCP Dup ACK") {
            detail.duplicate_acks += 1;
        }
    }

    if detail.total_packets > 0 {
        detail.retransmission_rate_percent =
            detail.retransmissions as f64 / detail.total_packets as f64 * 100.0;
    }
    detail
}
