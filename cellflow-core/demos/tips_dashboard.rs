//! Tips dashboard
//!
//! Rebuilds a small tips-analysis notebook on the engine: a dataset cell,
//! per-day summaries derived from it, a min-bill slider and metric dropdown
//! driving a filtered summary, and a static notes cell.
//!
//! Run with `RUST_LOG=cellflow_core=debug cargo run --example tips_dashboard`
//! to see each pass.

use std::time::Duration;

use cellflow_core::config::EngineConfig;
use cellflow_core::error::{CellError, EngineError};
use cellflow_core::graph::{Cell, GraphBuilder, Outputs};
use cellflow_core::reactive::{
    CellInputs, ChangeBatch, Engine, EventBridge, RenderContent, RenderFrame, RenderPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const DAYS: [&str; 4] = ["Thur", "Fri", "Sat", "Sun"];

const SLIDER_STEP: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    total_bill: f64,
    tip: f64,
    day: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DaySummary {
    day: String,
    mean_tip: f64,
    median_total: f64,
    count: usize,
}

fn dataset() -> Vec<Row> {
    let raw = [
        (16.99, 1.01, "Sun"),
        (10.34, 1.66, "Sun"),
        (21.01, 3.50, "Sun"),
        (23.68, 3.31, "Sun"),
        (24.59, 3.61, "Sun"),
        (25.29, 4.71, "Sun"),
        (20.65, 3.35, "Sat"),
        (17.92, 4.08, "Sat"),
        (20.29, 2.75, "Sat"),
        (15.77, 2.23, "Sat"),
        (39.42, 7.58, "Sat"),
        (19.82, 3.18, "Sat"),
        (27.20, 4.00, "Thur"),
        (22.76, 3.00, "Thur"),
        (17.29, 2.71, "Thur"),
        (19.44, 3.00, "Thur"),
        (8.77, 2.00, "Thur"),
        (28.97, 3.00, "Fri"),
        (22.49, 3.50, "Fri"),
        (5.75, 1.00, "Fri"),
        (16.32, 4.30, "Fri"),
        (22.75, 3.25, "Fri"),
    ];
    raw.iter()
        .map(|&(total_bill, tip, day)| Row {
            total_bill,
            tip,
            day: day.to_string(),
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn summarize(rows: &[Row]) -> Vec<DaySummary> {
    DAYS.iter()
        .filter_map(|&day| {
            let tips: Vec<f64> = rows.iter().filter(|r| r.day == day).map(|r| r.tip).collect();
            let totals: Vec<f64> = rows.iter().filter(|r| r.day == day).map(|r| r.total_bill).collect();
            if tips.is_empty() {
                return None;
            }
            Some(DaySummary {
                day: day.to_string(),
                mean_tip: mean(&tips),
                median_total: median(&totals),
                count: tips.len(),
            })
        })
        .collect()
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, CellError> {
    serde_json::to_value(value).map_err(|e| CellError::failed(e.to_string()))
}

/// First day with the strictly highest score.
fn best_by(grouped: &[DaySummary], score: impl Fn(&DaySummary) -> f64) -> Option<&DaySummary> {
    grouped.iter().fold(None::<&DaySummary>, |best, row| match best {
        Some(b) if score(b) >= score(row) => Some(b),
        _ => Some(row),
    })
}

fn notebook() -> Result<GraphBuilder, EngineError> {
    let mut builder = GraphBuilder::new();

    builder.register(
        Cell::source("load", ["df_raw"], |_: &CellInputs| {
            Ok(Outputs::new().with("df_raw", to_value(&dataset())?))
        })
        .with_render(|out| {
            let head: Vec<Value> = out
                .get("df_raw")
                .and_then(Value::as_array)
                .map(|rows| rows.iter().take(5).cloned().collect())
                .unwrap_or_default();
            vec![
                RenderPayload::Markdown("**Loaded dataset:** `tips` (first 5 rows)".into()),
                RenderPayload::Data(Value::Array(head)),
            ]
        }),
    )?;

    builder.register(
        Cell::new(
            "derive",
            ["df_raw"],
            ["mean_tip_by_day", "median_total_by_day"],
            |inputs: &CellInputs| {
                let rows: Vec<Row> = inputs.decode("df_raw")?;
                let summary = summarize(&rows);
                let mean_tip: Vec<Value> = summary
                    .iter()
                    .map(|s| json!({"day": s.day, "mean_tip": s.mean_tip}))
                    .collect();
                let median_total: Vec<Value> = summary
                    .iter()
                    .map(|s| json!({"day": s.day, "median_total": s.median_total}))
                    .collect();
                Ok(Outputs::new()
                    .with("mean_tip_by_day", Value::Array(mean_tip))
                    .with("median_total_by_day", Value::Array(median_total)))
            },
        )
        .with_render(|out| {
            let mut payloads = vec![RenderPayload::Markdown(
                "**Derived variables computed:** `mean_tip_by_day`, `median_total_by_day`".into(),
            )];
            payloads.extend(out.iter().map(|(_, v)| RenderPayload::Data(v.clone())));
            payloads
        }),
    )?;

    builder.declare_input("min_bill")?;
    builder.declare_input("metric")?;

    builder.register(Cell::new(
        "filter",
        ["df_raw", "min_bill"],
        ["filtered_df"],
        |inputs: &CellInputs| {
            let rows: Vec<Row> = inputs.decode("df_raw")?;
            let threshold: f64 = inputs.decode("min_bill")?;
            let kept: Vec<Row> = rows.into_iter().filter(|r| r.total_bill >= threshold).collect();
            Ok(Outputs::new().with("filtered_df", to_value(&kept)?))
        },
    ))?;

    builder.register(Cell::new("group", ["filtered_df"], ["grouped"], |inputs: &CellInputs| {
        let rows: Vec<Row> = inputs.decode("filtered_df")?;
        Ok(Outputs::new().with("grouped", to_value(&summarize(&rows))?))
    }))?;

    builder.register(
        Cell::new(
            "summary",
            ["grouped", "min_bill", "metric"],
            ["summary_md"],
            |inputs: &CellInputs| {
                let grouped: Vec<DaySummary> = inputs.decode("grouped")?;
                let threshold: f64 = inputs.decode("min_bill")?;
                let metric: String = inputs.decode("metric")?;

                if grouped.is_empty() {
                    let md = format!(
                        "**No rows** with `total_bill >= {threshold:.2}`. Try lowering the threshold."
                    );
                    return Ok(Outputs::new().with("summary_md", json!(md)));
                }

                let line = match metric.as_str() {
                    "mean_tip" => best_by(&grouped, |s| s.mean_tip).map(|b| {
                        format!("- **Avg tip (by day)**: highest on **{}** at **{:.2}**", b.day, b.mean_tip)
                    }),
                    "median_total" => best_by(&grouped, |s| s.median_total).map(|b| {
                        format!(
                            "- **Median total bill (by day)**: highest on **{}** at **{:.2}**",
                            b.day, b.median_total
                        )
                    }),
                    "count" => best_by(&grouped, |s| s.count as f64).map(|b| {
                        format!("- **Row count (by day)**: highest on **{}** at **{}**", b.day, b.count)
                    }),
                    other => return Err(CellError::failed(format!("unknown metric `{other}`"))),
                };
                let md = format!(
                    "### Filter: `total_bill >= {threshold:.2}`\n{}",
                    line.unwrap_or_default()
                );
                Ok(Outputs::new().with("summary_md", json!(md)))
            },
        )
        .with_render(|out| {
            out.get("summary_md")
                .and_then(Value::as_str)
                .map(|md| vec![RenderPayload::Markdown(md.to_string())])
                .unwrap_or_default()
        }),
    )?;

    builder.register(
        Cell::new("plot", ["grouped", "min_bill"], ["chart"], |inputs: &CellInputs| {
            let grouped: Vec<DaySummary> = inputs.decode("grouped")?;
            let threshold: f64 = inputs.decode("min_bill")?;
            if grouped.is_empty() {
                return Ok(Outputs::new().with("chart", Value::Null));
            }
            let days: Vec<&str> = grouped.iter().map(|s| s.day.as_str()).collect();
            let tips: Vec<f64> = grouped.iter().map(|s| s.mean_tip).collect();
            let chart = json!({
                "kind": "bar",
                "title": format!("Mean tip by day (total_bill >= {threshold:.2})"),
                "ylabel": "Mean tip",
                "x": days,
                "y": tips,
            });
            Ok(Outputs::new().with("chart", chart))
        })
        .with_render(|out| match out.get("chart") {
            Some(Value::Null) | None => Vec::new(),
            Some(chart) => vec![RenderPayload::Data(chart.clone())],
        }),
    )?;

    builder.register(
        Cell::source("complexity", Vec::<String>::new(), |_: &CellInputs| Ok(Outputs::new()))
            .with_render(|_| {
                vec![
                    RenderPayload::Markdown("## Algorithmic Complexity (examples)".into()),
                    RenderPayload::Markdown(r"$T(n) = O(n \log n)$ (sorting step)".into()),
                    RenderPayload::Markdown(r"$S(n) = O(n)$ (space complexity)".into()),
                ]
            }),
    )?;

    Ok(builder)
}

fn print_frame(frame: RenderFrame) {
    match frame.content {
        RenderContent::Display(payloads) => {
            for payload in payloads {
                match payload {
                    RenderPayload::Markdown(text) | RenderPayload::Text(text) => {
                        println!("[pass {} | {}] {}", frame.pass, frame.cell, text)
                    }
                    RenderPayload::Data(value) => {
                        println!("[pass {} | {}] {}", frame.pass, frame.cell, value)
                    }
                    other => println!("[pass {} | {}] {:?}", frame.pass, frame.cell, other),
                }
            }
        }
        RenderContent::Error(marker) => {
            println!("[pass {} | {}] error: {:?}", frame.pass, frame.cell, marker)
        }
    }
}

/// Snap a raw slider position to the slider's step.
fn slider_value(raw: f64) -> Value {
    json!((raw / SLIDER_STEP).round() * SLIDER_STEP)
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::default().with_debounce(Duration::from_millis(150));
    let engine = Engine::with_config(notebook()?, print_frame, config)?;

    // Initial evaluation with the controls at their defaults.
    let mut initial = ChangeBatch::new();
    initial.inject("min_bill", json!(10.0));
    initial.inject("metric", json!("mean_tip"));
    initial.run_all();
    engine.submit(initial)?;

    let bridge = EventBridge::new(engine.clone());
    let settle = bridge.spawn_settle_loop();

    println!("\n-- dragging the slider --");
    for raw in [11.2, 13.9, 17.4, 20.1] {
        bridge.on_control_changed("min_bill", slider_value(raw))?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    println!("\n-- switching metric --");
    bridge.on_control_changed("metric", json!("count"))?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    println!("\n-- threshold above every bill --");
    bridge.on_control_changed("min_bill", json!(60.0))?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    settle.abort();
    println!("\npasses run: {}", engine.passes_run()?);
    Ok(())
}
