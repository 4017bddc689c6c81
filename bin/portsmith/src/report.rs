//! Terminal rendering of run results and manifest records.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use portsmith_deploy::{Action, Error, ProxyRecord, RouteStatus};

/// Result of one unit of work on one network.
pub struct Row {
    pub network: String,
    pub contract: String,
    pub result: Result<Detail, Error>,
}

pub enum Detail {
    Transition(Action, ProxyRecord),
    Route { chain_id: String, status: RouteStatus },
}

impl Row {
    pub fn failed(&self) -> bool {
        self.result.is_err()
    }
}

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().copied());
    table
}

pub fn outcomes(rows: &[Row]) -> Table {
    let mut t = table(&["network", "contract", "result", "proxy", "implementation", "version"]);
    for row in rows {
        let mut cells = vec![Cell::new(&row.network), Cell::new(&row.contract)];
        match &row.result {
            Ok(Detail::Transition(action, record)) => {
                cells.push(Cell::new(action).fg(Color::Green));
                cells.push(Cell::new(record.proxy_address));
                cells.push(Cell::new(record.implementation_address));
                cells.push(Cell::new(format!("v{}", record.abi_version)));
            }
            Ok(Detail::Route { chain_id, status }) => {
                let status = match status {
                    RouteStatus::Registered { transaction_hash } => {
                        format!("route {chain_id} registered ({transaction_hash})")
                    }
                    RouteStatus::AlreadyRegistered => format!("route {chain_id} already registered"),
                };
                cells.push(Cell::new(status).fg(Color::Green));
            }
            Err(e) => {
                let color = if e.is_retryable() { Color::Yellow } else { Color::Red };
                cells.push(Cell::new(format!("{} error: {}", e.class(), e.kind)).fg(color));
            }
        }
        t.add_row(cells);
    }
    t
}

/// Live records, followed by superseded ones when `history` is non-empty.
pub fn records(live: &[ProxyRecord], history: &[ProxyRecord]) -> Table {
    let mut t = table(&[
        "network",
        "contract",
        "kind",
        "proxy",
        "implementation",
        "version",
        "origin",
        "last transaction",
        "state",
    ]);
    let rows = live
        .iter()
        .map(|r| (r, false))
        .chain(history.iter().map(|r| (r, true)));
    for (r, superseded) in rows {
        let state = if superseded {
            Cell::new("superseded").fg(Color::DarkGrey)
        } else {
            Cell::new("live").fg(Color::Green)
        };
        t.add_row(vec![
            Cell::new(&r.network),
            Cell::new(&r.logical_name),
            Cell::new(r.kind),
            Cell::new(r.proxy_address),
            Cell::new(r.implementation_address),
            Cell::new(format!("v{}", r.abi_version)),
            Cell::new(r.origin),
            Cell::new(
                r.last_transaction_hash
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            state,
        ]);
    }
    t
}
