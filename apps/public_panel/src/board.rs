// Plain-text rendering of the call board
use chrono::{DateTime, TimeZone};
use qpanel_core::{LaunchWarning, QueuePanelState};
use std::fmt::{Display, Write};

/// Renders every queue view, newest call first, with the highlighted call
/// marked. Launch warnings are printed above the queues.
pub fn render<Tz>(views: &[QueuePanelState], connected: bool, warnings: &[LaunchWarning], tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut out = String::new();
    let status = if connected { "conectado" } else { "desconectado" };
    let _ = writeln!(out, "==== Painel de chamadas [{}] ====", status);
    for warning in warnings {
        let _ = writeln!(out, "! {}", warning);
    }

    if views.is_empty() {
        let _ = writeln!(out, "(aguardando chamadas)");
        return out;
    }

    for view in views {
        let title = view
            .records
            .iter()
            .find_map(|r| r.queue_name.as_deref())
            .map(|name| format!("Fila {} - {}", view.queue_id, name))
            .unwrap_or_else(|| format!("Fila {}", view.queue_id));
        let _ = writeln!(out, "{}", title);
        if view.records.is_empty() {
            let _ = writeln!(out, "   (sem chamadas)");
            continue;
        }
        for record in &view.records {
            let marker = if record.is_new { ">>" } else { "  " };
            let ticket = record
                .ticket
                .as_deref()
                .map(|t| format!("[{}] ", t))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                " {} {}  {}{}  {}",
                marker,
                local_time(&record.timestamp, tz),
                ticket,
                record.subject_name,
                record.location
            );
        }
    }
    out
}

fn local_time<Tz>(at: &DateTime<chrono::Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%H:%M:%S").to_string()
}
