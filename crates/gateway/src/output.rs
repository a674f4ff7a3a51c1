//! Result rendering for the discovery CLI.

use domain::probe::{DiscoveredDevice, ProbeOutcome};

pub fn render_json(devices: &[DiscoveredDevice]) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(devices)?)
}

fn outcome_label(outcome: &ProbeOutcome) -> String {
    match outcome {
        ProbeOutcome::Present => "present".to_string(),
        ProbeOutcome::PresentWithException { code } => format!("present (exception {code})"),
        ProbeOutcome::NotPresentTimeout => "timeout".to_string(),
        ProbeOutcome::NotPresentCrc => "crc error".to_string(),
        ProbeOutcome::NotPresentOther => "no response".to_string(),
    }
}

pub fn render_table(devices: &[DiscoveredDevice]) -> String {
    if devices.is_empty() {
        return "no devices found".to_string();
    }

    let header = ["SLAVE", "LINK", "OUTCOME", "TIME", "FC43", "VENDOR", "PRODUCT"];
    let rows: Vec<[String; 7]> = devices
        .iter()
        .map(|device| {
            [
                device.slave_id.to_string(),
                device.link.to_string(),
                outcome_label(&device.probe.outcome),
                format!("{} ms", device.probe.response_time_ms),
                if device.probe.identification.supports_fc43 {
                    "yes".to_string()
                } else {
                    "no".to_string()
                },
                device
                    .probe
                    .identification
                    .vendor_name
                    .clone()
                    .unwrap_or_else(|| "-".to_string()),
                device
                    .probe
                    .identification
                    .product_code
                    .clone()
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|cell| cell.len()).collect();
    for row in &rows {
        for (index, cell) in row.iter().enumerate() {
            widths[index] = widths[index].max(cell.len());
        }
    }

    let render_row = |cells: &[String]| {
        cells
            .iter()
            .enumerate()
            .map(|(index, cell)| format!("{cell:<width$}", width = widths[index]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(render_row(
        &header.iter().map(|cell| cell.to_string()).collect::<Vec<_>>(),
    ));
    for row in &rows {
        lines.push(render_row(row));
    }
    lines.join("\n")
}
