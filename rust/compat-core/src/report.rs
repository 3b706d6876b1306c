//! Plain-text tables for the terminal.

use crate::bandwidth::{BandwidthMatrix, ToolAvailability};
use crate::collective::CollectiveTable;
use crate::coordinator::session::{NodeInfo, NodeRole};
use crate::probe::EnvironmentReport;

const MAX_DETAIL_CHARS: usize = 100;

/// Render an aligned ASCII table:
///
/// ```text
/// +------+-------+
/// | Rank | Node  |
/// +------+-------+
/// | 0    | gpu-a |
/// +------+-------+
/// ```
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let line = format!(
        "+-{}-+",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-")
    );

    let mut out = vec![line.clone(), render_row(&widths, headers.iter().copied()), line.clone()];
    for row in rows {
        out.push(render_row(&widths, row.iter().map(String::as_str)));
    }
    out.push(line);
    out.join("\n")
}

fn render_row<'a>(widths: &[usize], mut cells: impl Iterator<Item = &'a str>) -> String {
    let padded: Vec<String> = widths
        .iter()
        .map(|w| {
            let cell = cells.next().unwrap_or("");
            format!("{}{}", cell, " ".repeat(w.saturating_sub(cell.chars().count())))
        })
        .collect();
    format!("| {} |", padded.join(" | "))
}

fn truncate(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= MAX_DETAIL_CHARS {
        single_line
    } else {
        let cut: String = single_line.chars().take(MAX_DETAIL_CHARS - 3).collect();
        format!("{}...", cut)
    }
}

fn opt(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}

pub fn render_environment(report: &EnvironmentReport) -> String {
    let rows: Vec<Vec<String>> = report
        .checks
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                c.status.label().to_string(),
                if c.mandatory { "yes" } else { "no" }.to_string(),
                truncate(&c.detail),
            ]
        })
        .collect();
    format!(
        "Environment of {} ({} GPU(s))\n{}",
        report.hostname,
        report.gpu_count,
        format_table(&["Check", "Status", "Required", "Detail"], &rows)
    )
}

pub fn render_roster(nodes: &[NodeInfo]) -> String {
    let rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|n| {
            vec![
                n.rank.to_string(),
                match n.role {
                    NodeRole::Coordinator => "coordinator",
                    NodeRole::Worker => "worker",
                }
                .to_string(),
                n.hostname.clone(),
                n.address.clone(),
                n.gpu_count.to_string(),
            ]
        })
        .collect();
    format_table(&["Rank", "Role", "Node", "Address", "GPUs"], &rows)
}

pub fn render_collective(table: &CollectiveTable) -> String {
    let rows: Vec<Vec<String>> = table
        .rows()
        .map(|r| {
            vec![
                r.rank.to_string(),
                r.hostname.clone(),
                r.status.label().to_string(),
                opt(r.sum, 1),
                format!("{:.1}", r.expected_sum),
                format!("{:.2}", r.elapsed_secs),
                opt(r.bus_bandwidth_gb_s, 1),
                truncate(&r.error),
            ]
        })
        .collect();
    format_table(
        &["Rank", "Node", "Status", "Sum", "Expected", "Elapsed(s)", "BusBW(GB/s)", "Detail"],
        &rows,
    )
}

pub fn render_tool_availability(tool: &str, availability: &[ToolAvailability]) -> String {
    let rows: Vec<Vec<String>> = availability
        .iter()
        .map(|a| {
            vec![
                a.node.rank.to_string(),
                a.node.hostname.clone(),
                a.node.address.clone(),
                if a.status.ok { "OK" } else { "MISSING" }.to_string(),
                truncate(&a.status.detail),
            ]
        })
        .collect();
    format_table(&["Rank", "Node", "IP", tool, "Detail"], &rows)
}

/// One row per measured pair.
pub fn render_bandwidth_pairs(matrix: &BandwidthMatrix) -> String {
    let rows: Vec<Vec<String>> = matrix
        .entries()
        .map(|e| {
            vec![
                format!("{}-{}", e.a.rank, e.b.rank),
                format!("{} ({})", e.a.hostname, e.a.address),
                format!("{} ({})", e.b.hostname, e.b.address),
                opt(e.forward.gbit_per_sec(), 2),
                opt(e.reverse.gbit_per_sec(), 2),
                opt(e.average_gbit_per_sec(), 2),
                if e.is_ok() { "OK" } else { "FAIL" }.to_string(),
                truncate(&e.detail()),
            ]
        })
        .collect();
    format_table(
        &["Pair", "NodeA", "NodeB", "A->B Gbps", "B->A Gbps", "Avg Gbps", "Status", "Detail"],
        &rows,
    )
}

/// Square matrix of average Gbit/s by rank. The diagonal is not measured.
pub fn render_bandwidth_matrix(matrix: &BandwidthMatrix) -> String {
    let nodes = matrix.nodes();
    let labels: Vec<String> = nodes.iter().map(|n| format!("r{}", n.rank)).collect();
    let mut headers: Vec<&str> = vec!["Gbps"];
    headers.extend(labels.iter().map(String::as_str));

    let rows: Vec<Vec<String>> = nodes
        .iter()
        .zip(&labels)
        .map(|(row_node, label)| {
            let mut row = vec![format!("{} {}", label, row_node.hostname)];
            row.extend(nodes.iter().map(|col_node| {
                if row_node.rank == col_node.rank {
                    return "-".to_string();
                }
                match matrix.get(row_node.rank, col_node.rank) {
                    None => "?".to_string(),
                    Some(entry) if !entry.is_ok() => match entry.average_gbit_per_sec() {
                        Some(avg) => format!("{:.2}!", avg),
                        None => "FAIL".to_string(),
                    },
                    Some(entry) => opt(entry.average_gbit_per_sec(), 2),
                }
            }));
            row
        })
        .collect();
    format_table(&headers, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::{BandwidthMatrixEntry, BandwidthSample, MeshNode, ToolStatus};
    use crate::collective::{CollectiveStatus, CollectiveTestResult};
    use crate::probe::{CheckResult, CheckStatus};

    fn node(rank: u32) -> MeshNode {
        MeshNode {
            rank,
            hostname: format!("gpu-{}", rank),
            address: format!("10.0.0.{}", rank + 1),
        }
    }

    #[test]
    fn test_format_table_layout() {
        let table = format_table(
            &["Rank", "Node"],
            &[vec!["0".to_string(), "gpu-a".to_string()], vec!["1".to_string(), "b".to_string()]],
        );
        let expected = "\
+------+-------+
| Rank | Node  |
+------+-------+
| 0    | gpu-a |
| 1    | b     |
+------+-------+";
        assert_eq!(table, expected);
    }

    #[test]
    fn test_format_table_no_rows() {
        let table = format_table(&["A"], &[]);
        assert_eq!(table, "+---+\n| A |\n+---+\n+---+");
    }

    #[test]
    fn test_truncate_long_detail() {
        let long = "x".repeat(300);
        let t = truncate(&long);
        assert_eq!(t.chars().count(), MAX_DETAIL_CHARS);
        assert!(t.ends_with("..."));
        assert_eq!(truncate("a\n  b"), "a b");
    }

    #[test]
    fn test_render_collective_rows() {
        let mut table = CollectiveTable::new();
        table.record(CollectiveTestResult {
            rank: 0,
            world_size: 2,
            hostname: "gpu-0".to_string(),
            status: CollectiveStatus::Ok,
            sum: Some(1.0),
            expected_sum: 1.0,
            elapsed_secs: 2.5,
            bus_bandwidth_gb_s: Some(180.0),
            error: String::new(),
        });
        table.fill_missing([(1, "gpu-1")], 2, std::time::Duration::from_secs(270));

        let out = render_collective(&table);
        assert!(out.contains("| 0    | gpu-0 | OK      | 1.0 | 1.0      | 2.50       | 180.0       |"));
        assert!(out.contains("TIMEOUT"));
        assert!(out.contains("no result within 270s"));
    }

    #[test]
    fn test_render_environment() {
        let report = EnvironmentReport {
            hostname: "gpu-0".to_string(),
            gpu_count: 8,
            checks: vec![CheckResult {
                name: "collective_library".to_string(),
                status: CheckStatus::Fail,
                mandatory: true,
                detail: "NCCL via torch.distributed unavailable".to_string(),
            }],
        };
        let out = render_environment(&report);
        assert!(out.starts_with("Environment of gpu-0 (8 GPU(s))"));
        assert!(out.contains("| collective_library | FAIL   | yes      |"));
    }

    #[test]
    fn test_render_bandwidth() {
        let mut matrix = BandwidthMatrix::new(vec![node(0), node(1), node(2)]);
        matrix.record(BandwidthMatrixEntry {
            a: node(0),
            b: node(1),
            forward: BandwidthSample::measured(9.4e9),
            reverse: BandwidthSample::measured(9.4e9),
        });
        matrix.record(BandwidthMatrixEntry {
            a: node(0),
            b: node(2),
            forward: BandwidthSample::failed("refused"),
            reverse: BandwidthSample::failed("refused"),
        });

        let pairs = render_bandwidth_pairs(&matrix);
        assert!(pairs.contains("| 0-1  | gpu-0 (10.0.0.1) | gpu-1 (10.0.0.2) | 9.40      | 9.40      | 9.40     | OK     |"));
        assert!(pairs.contains("A->B: refused; B->A: refused"));

        let grid = render_bandwidth_matrix(&matrix);
        assert!(grid.contains("| r0 gpu-0 | -    | 9.40 | FAIL |"));
        assert!(grid.contains("| r1 gpu-1 | 9.40 | -    | ?    |"));
    }

    #[test]
    fn test_render_tool_availability() {
        let out = render_tool_availability(
            "iperf3",
            &[ToolAvailability {
                node: node(1),
                status: ToolStatus {
                    ok: false,
                    detail: "iperf3 not found".to_string(),
                },
            }],
        );
        assert!(out.contains("| Rank | Node  | IP       | iperf3  | Detail           |"));
        assert!(out.contains("| 1    | gpu-1 | 10.0.0.2 | MISSING | iperf3 not found |"));
    }
}
