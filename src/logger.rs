//! Optional request log.
//!
//! The request logger is enabled with the `--request-log` command-line option, or the
//! [`LoadTestDefault::RequestLog`](../config/enum.LoadTestDefault.html#variant.RequestLog)
//! default configuration option. When enabled, a logger task is launched and every
//! [`ActionResult`](../executor/struct.ActionResult.html) is forwarded to it by the
//! metrics aggregator, so virtual users never wait on disk. The logger task writes
//! through Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html), which is
//! flushed when the load test finishes.
//!
//! The format of the log is configured with `--request-format`:
//!  - `json` (default): one JSON object per line
//!  - `csv`: comma separated values, starting with a header row
//!  - `raw`: the Debug output of each result
//!  - `pretty`: the pretty-printed Debug output of each result

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;

use crate::config::LoadTestConfiguration;
use crate::executor::ActionResult;
use crate::HatchlingError;

/// Sends results to the request logger. `None` tells the logger to flush and exit.
pub(crate) type RequestLoggerTx = flume::Sender<Option<ActionResult>>;

/// The request logger task, returning an error if writing failed.
pub(crate) type RequestLoggerHandle = JoinHandle<Result<(), HatchlingError>>;

/// Buffer size of the request log writer.
const BUFFER_CAPACITY: usize = 64 * 1024;

/// Supported request log formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestLogFormat {
    Csv,
    Json,
    Raw,
    Pretty,
}
/// Allow `--request-format` from the command line by implementing [`FromStr`].
impl FromStr for RequestLogFormat {
    type Err = HatchlingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Use a [`RegexSet`] to match string representations of `RequestLogFormat`,
        // returning the appropriate enum value.
        let log_format = RegexSet::new([
            r"(?i)^csv$",
            r"(?i)^(json|jsonl)$",
            r"(?i)^(raw|debug)$",
            r"(?i)^pretty$",
        ])
        .expect("failed to compile log_format RegexSet");
        let matches = log_format.matches(s);
        if matches.matched(0) {
            Ok(RequestLogFormat::Csv)
        } else if matches.matched(1) {
            Ok(RequestLogFormat::Json)
        } else if matches.matched(2) {
            Ok(RequestLogFormat::Raw)
        } else if matches.matched(3) {
            Ok(RequestLogFormat::Pretty)
        } else {
            Err(HatchlingError::InvalidOption {
                option: format!("RequestLogFormat::{:?}", s),
                value: s.to_string(),
                detail: "Invalid request format, expected: csv, json, raw or pretty".to_string(),
            })
        }
    }
}
impl RequestLogFormat {
    /// The first line of the log, if the format has one.
    fn header(&self) -> Option<&'static str> {
        match self {
            RequestLogFormat::Csv => {
                Some("label,method,path,outcome,response_time,status_code,error")
            }
            _ => None,
        }
    }

    /// Format one result as a single log entry.
    fn format(&self, result: &ActionResult) -> Result<String, HatchlingError> {
        Ok(match self {
            RequestLogFormat::Json => serde_json::to_string(result)?,
            RequestLogFormat::Csv => [
                csv_field(&result.label),
                result.method.to_string(),
                csv_field(&result.path),
                format!("{:?}", result.outcome),
                result.response_time().to_string(),
                result
                    .status_code
                    .map(|status_code| status_code.to_string())
                    .unwrap_or_default(),
                csv_field(result.error.as_deref().unwrap_or_default()),
            ]
            .join(","),
            RequestLogFormat::Raw => format!("{:?}", result),
            RequestLogFormat::Pretty => format!("{:#?}", result),
        })
    }
}

/// Quote a CSV field if it contains a separator, a quote or a line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Open the request log, if one is configured, and launch the logger task.
pub(crate) async fn setup_request_logger(
    configuration: &LoadTestConfiguration,
) -> Result<(Option<RequestLoggerHandle>, Option<RequestLoggerTx>), HatchlingError> {
    if configuration.request_log.is_empty() {
        return Ok((None, None));
    }

    let format = configuration
        .request_format
        .unwrap_or(RequestLogFormat::Json);
    let file = File::create(&configuration.request_log).await?;
    info!(
        "writing {:?} request log to: {}",
        format, configuration.request_log
    );

    let (tx, rx) = flume::unbounded();
    let handle = tokio::spawn(logger_main(
        BufWriter::with_capacity(BUFFER_CAPACITY, file),
        format,
        configuration.request_log.to_string(),
        rx,
    ));
    Ok((Some(handle), Some(tx)))
}

/// Logger task, writes each result it receives until told to exit.
async fn logger_main(
    mut writer: BufWriter<File>,
    format: RequestLogFormat,
    path: String,
    receiver: flume::Receiver<Option<ActionResult>>,
) -> Result<(), HatchlingError> {
    if let Some(header) = format.header() {
        writer.write_all(format!("{}\n", header).as_bytes()).await?;
    }

    // Exit on an empty message, or once every sender is gone.
    while let Ok(Some(result)) = receiver.recv_async().await {
        let entry = match format.format(&result) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("failed to format request log entry: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(format!("{}\n", entry).as_bytes()).await {
            warn!("failed to write to {}: {}", path, e);
        }
    }

    // Cleanup and flush the log to disk.
    info!("flushing request log: {}", path);
    writer.flush().await?;

    Ok(())
}
