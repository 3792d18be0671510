use metergrid::model::source_key;
use metergrid::{
    compact_range, load_labels, load_sources, upload, CsvWindow, JsonFileFetcher, MeterStore,
    MetricSelection, PollScheduler, PushHub, QueryApi, ResultFormat, RuntimeConfig,
};
use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

const USAGE: &str = "usage: metergrid <command> [args]

commands:
  upload <source> <file>                          import delimited history
  export <sources> [--metrics LIST]
         (--elapsed MS | --start MS --end MS)     write merged CSV to stdout
  latest <source>                                 newest record as JSON
  diff <source> --elapsed MS [--metrics LIST]     last minus first per metric
  compact <source> <start_ms> <end_ms>            condense raw history
  poll <sources.json> --snapshots <dir>           poll JSON snapshot files

<sources> is comma-separated; LIST is comma-separated metric names,
'all', or omitted for the default kW set.";

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_ms(raw: &str, what: &str) -> Result<i64, String> {
    raw.parse::<i64>()
        .map_err(|_| format!("{} must be an integer millisecond timestamp, got '{}'", what, raw))
}

fn csv_window(args: &[String]) -> Result<CsvWindow, String> {
    if let Some(elapsed) = flag_value(args, "--elapsed") {
        return Ok(CsvWindow::Recent {
            elapsed_ms: parse_ms(&elapsed, "--elapsed")?,
        });
    }
    match (flag_value(args, "--start"), flag_value(args, "--end")) {
        (Some(start), Some(end)) => Ok(CsvWindow::Range {
            start_ms: parse_ms(&start, "--start")?,
            end_ms: parse_ms(&end, "--end")?,
        }),
        _ => Err("need --elapsed or both --start and --end".to_string()),
    }
}

async fn run(args: Vec<String>) -> Result<(), String> {
    let config = RuntimeConfig::from_env().map_err(|e| e.to_string())?;
    let store = Arc::new(MeterStore::open(&config.db_path).map_err(|e| e.to_string())?);
    let labels = config
        .labels_path
        .as_deref()
        .map(load_labels)
        .unwrap_or_default();
    let api = QueryApi::new(store.clone(), config.zone, labels);

    let command = args.first().map(String::as_str).unwrap_or("");
    match command {
        "upload" => {
            let (source, file) = match (args.get(1), args.get(2)) {
                (Some(source), Some(file)) => (source, file),
                _ => return Err("upload needs <source> <file>".to_string()),
            };
            let report =
                upload(&store, source, file, config.zone).map_err(|e| e.to_string())?;
            println!("accepted {} lines", report.accepted);
            for error in &report.errors {
                eprintln!("{}", error);
            }
            Ok(())
        }
        "export" => {
            let sources: Vec<String> = match args.get(1) {
                Some(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
                None => return Err("export needs <sources>".to_string()),
            };
            let selection = MetricSelection::parse(flag_value(&args, "--metrics").as_deref());
            let window = csv_window(&args)?;
            let csv = api
                .export_csv(&sources, &selection, window)
                .map_err(|e| e.to_string())?;
            println!("{}", csv);
            Ok(())
        }
        "latest" => {
            let source = args.get(1).ok_or("latest needs <source>")?;
            match api.get_latest(source).map_err(|e| e.to_string())? {
                Some(record) => {
                    let json =
                        serde_json::to_string_pretty(&record.values).map_err(|e| e.to_string())?;
                    println!("time: {}", record.time);
                    println!("{}", json);
                }
                None => println!("no records for {}", source),
            }
            Ok(())
        }
        "diff" => {
            let source = args.get(1).ok_or("diff needs <source>")?;
            let elapsed = flag_value(&args, "--elapsed").ok_or("diff needs --elapsed MS")?;
            let selection = MetricSelection::parse(flag_value(&args, "--metrics").as_deref());
            let diff = api
                .diff(source, parse_ms(&elapsed, "--elapsed")?, &selection)
                .map_err(|e| e.to_string())?;
            for (name, value) in &diff {
                println!("{}: {}", name, value);
            }
            Ok(())
        }
        "compact" => {
            let (source, start, end) = match (args.get(1), args.get(2), args.get(3)) {
                (Some(source), Some(start), Some(end)) => (source, start, end),
                _ => return Err("compact needs <source> <start_ms> <end_ms>".to_string()),
            };
            let report = compact_range(
                store,
                source,
                parse_ms(start, "start")?,
                parse_ms(end, "end")?,
            )
            .await
            .map_err(|e| e.to_string())?;
            println!(
                "condensed {} raw records into {} minute buckets ({} failed batches)",
                report.raw_records, report.buckets, report.failed_batches
            );
            Ok(())
        }
        "poll" => {
            let list = args.get(1).ok_or("poll needs <sources.json>")?;
            let dir = flag_value(&args, "--snapshots").ok_or("poll needs --snapshots <dir>")?;
            let sources = load_sources(list).map_err(|e| e.to_string())?;
            if sources.is_empty() {
                return Err("source list is empty".to_string());
            }

            let hub = Arc::new(PushHub::new());
            let mut scheduler = PollScheduler::new();
            for cfg in sources {
                let path = Path::new(&dir).join(format!("{}.json", source_key(&cfg.source)));
                let fetcher = Arc::new(JsonFileFetcher::new(path));
                scheduler.start(store.clone(), hub.clone(), cfg, fetcher);
            }

            tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
            scheduler.stop_all();
            Ok(())
        }
        "series" => {
            // undocumented debug view of the resampled chart payload
            let source = args.get(1).ok_or("series needs <source>")?;
            let elapsed = flag_value(&args, "--elapsed").ok_or("series needs --elapsed MS")?;
            let selection = MetricSelection::parse(flag_value(&args, "--metrics").as_deref());
            let result = api
                .get_recent(
                    source,
                    parse_ms(&elapsed, "--elapsed")?,
                    &selection,
                    ResultFormat::Series,
                )
                .map_err(|e| e.to_string())?;
            let series = match result {
                metergrid::QueryResult::Series(series) => series,
                _ => unreachable!("series format returns series"),
            };
            let json = serde_json::to_string_pretty(&series).map_err(|e| e.to_string())?;
            println!("{}", json);
            Ok(())
        }
        _ => Err(USAGE.to_string()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}
