pub mod aggregator;
pub mod bucket;
pub mod diagnostics;
pub mod engine;
pub mod flush;
pub mod gateway;
pub mod query;
pub mod retention;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MetricsError;

pub use bucket::{Bucket, StatusCounts};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use engine::MetricsEngine;
pub use gateway::IngestionGateway;
pub use query::{DashboardReport, QueryEngine, SeriesPoint};

/// Route used for request samples the producer could not attribute.
pub const UNKNOWN_ROUTE: &str = "<unknown>";

/// A single observation handed to the engine by a producer.
/// This is the "write" side: middleware and the system sampler create these.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub kind: SampleKind,
}

/// Request-shaped and system-shaped samples feed disjoint series families.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleKind {
    Request(RequestSample),
    System(SystemSample),
}

/// One completed HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSample {
    /// Route template, e.g. "/api/users/:id"
    pub route: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub duration_seconds: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// One process tick. Absent readings are simply not recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub memory_available_mb: Option<f64>,
    pub net_sent_bytes: Option<f64>,
    pub net_recv_bytes: Option<f64>,
}

impl Sample {
    pub fn request(timestamp: DateTime<Utc>, request: RequestSample) -> Self {
        Self {
            timestamp,
            kind: SampleKind::Request(request),
        }
    }

    pub fn system(timestamp: DateTime<Utc>, system: SystemSample) -> Self {
        Self {
            timestamp,
            kind: SampleKind::System(system),
        }
    }

    /// Reject samples that would corrupt a bucket.
    pub fn validate(&self) -> Result<(), MetricsError> {
        if self.timestamp.timestamp() < 0 {
            return Err(MetricsError::InvalidSample(format!(
                "timestamp {} predates the epoch",
                self.timestamp
            )));
        }
        match &self.kind {
            SampleKind::Request(r) => {
                if !r.duration_seconds.is_finite() || r.duration_seconds < 0.0 {
                    return Err(MetricsError::InvalidSample(format!(
                        "duration {} is not a non-negative number",
                        r.duration_seconds
                    )));
                }
                if let Some(code) = r.status_code {
                    if StatusClass::from_code(code).is_none() {
                        return Err(MetricsError::InvalidSample(format!(
                            "status code {code} is outside 100..=599"
                        )));
                    }
                }
            }
            SampleKind::System(s) => {
                for (metric, value) in s.readings() {
                    if !value.is_finite() || value < 0.0 {
                        return Err(MetricsError::InvalidSample(format!(
                            "{metric} reading {value} is not a non-negative number"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Expand the sample into the per-series values it contributes.
    pub fn observations(&self) -> Vec<Observation> {
        match &self.kind {
            SampleKind::Request(r) => {
                let route = r.route.clone().unwrap_or_else(|| UNKNOWN_ROUTE.into());
                let status = r.status_code.and_then(StatusClass::from_code);
                let mut out = vec![
                    Observation {
                        key: SeriesKey::request(&route, RequestMetric::Latency),
                        value: r.duration_seconds,
                        status,
                    },
                    Observation {
                        key: SeriesKey::request(&route, RequestMetric::BytesIn),
                        value: r.bytes_in as f64,
                        status: None,
                    },
                    Observation {
                        key: SeriesKey::request(&route, RequestMetric::BytesOut),
                        value: r.bytes_out as f64,
                        status: None,
                    },
                ];
                if let Some(method) = &r.method {
                    out.push(Observation {
                        key: SeriesKey::Method(method.to_ascii_uppercase()),
                        value: r.duration_seconds,
                        status: None,
                    });
                }
                out
            }
            SampleKind::System(s) => s
                .readings()
                .into_iter()
                .map(|(metric, value)| Observation {
                    key: SeriesKey::System(metric),
                    value,
                    status: None,
                })
                .collect(),
        }
    }
}

impl SystemSample {
    /// The readings that are present, tagged with the series they feed.
    pub fn readings(&self) -> Vec<(SystemMetric, f64)> {
        [
            (SystemMetric::CpuPercent, self.cpu_percent),
            (SystemMetric::MemoryPercent, self.memory_percent),
            (SystemMetric::MemoryUsedMb, self.memory_used_mb),
            (SystemMetric::MemoryAvailableMb, self.memory_available_mb),
            (SystemMetric::NetworkIoSent, self.net_sent_bytes),
            (SystemMetric::NetworkIoRecv, self.net_recv_bytes),
        ]
        .into_iter()
        .filter_map(|(metric, value)| value.map(|v| (metric, v)))
        .collect()
    }
}

/// One value destined for one series.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: SeriesKey,
    pub value: f64,
    pub status: Option<StatusClass>,
}

// ─── Status classes ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StatusClass {
    #[serde(rename = "1XX")]
    Informational,
    #[serde(rename = "2XX")]
    Success,
    #[serde(rename = "3XX")]
    Redirection,
    #[serde(rename = "4XX")]
    ClientError,
    #[serde(rename = "5XX")]
    ServerError,
}

impl StatusClass {
    pub const ALL: [StatusClass; 5] = [
        StatusClass::Informational,
        StatusClass::Success,
        StatusClass::Redirection,
        StatusClass::ClientError,
        StatusClass::ServerError,
    ];

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            100..=199 => Some(Self::Informational),
            200..=299 => Some(Self::Success),
            300..=399 => Some(Self::Redirection),
            400..=499 => Some(Self::ClientError),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Informational => "1XX",
            Self::Success => "2XX",
            Self::Redirection => "3XX",
            Self::ClientError => "4XX",
            Self::ServerError => "5XX",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::ClientError | Self::ServerError)
    }
}

// ─── Series keys ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemMetric {
    CpuPercent,
    MemoryPercent,
    MemoryUsedMb,
    MemoryAvailableMb,
    NetworkIoSent,
    NetworkIoRecv,
}

impl SystemMetric {
    pub const ALL: [SystemMetric; 6] = [
        SystemMetric::CpuPercent,
        SystemMetric::MemoryPercent,
        SystemMetric::MemoryUsedMb,
        SystemMetric::MemoryAvailableMb,
        SystemMetric::NetworkIoSent,
        SystemMetric::NetworkIoRecv,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CpuPercent => "cpu_percent",
            Self::MemoryPercent => "memory_percent",
            Self::MemoryUsedMb => "memory_used_mb",
            Self::MemoryAvailableMb => "memory_available_mb",
            Self::NetworkIoSent => "network_io_sent",
            Self::NetworkIoRecv => "network_io_recv",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl fmt::Display for SystemMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestMetric {
    /// Seconds; the bucket also counts status classes
    Latency,
    BytesIn,
    BytesOut,
}

impl RequestMetric {
    pub fn name(self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::BytesIn => "bytes_in",
            Self::BytesOut => "bytes_out",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        [Self::Latency, Self::BytesIn, Self::BytesOut]
            .into_iter()
            .find(|m| m.name() == name)
    }
}

/// Identity of one metric stream.
///
/// Text form (used by every backend): `system:<metric>`,
/// `request:<metric>:<route>`, `method:<METHOD>`. The route goes last so it
/// may itself contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeriesKey {
    System(SystemMetric),
    Request { route: String, metric: RequestMetric },
    Method(String),
}

impl SeriesKey {
    pub fn request(route: &str, metric: RequestMetric) -> Self {
        Self::Request {
            route: route.to_string(),
            metric,
        }
    }

    /// Prefix shared by every route's series for `metric`.
    pub fn request_prefix(metric: RequestMetric) -> String {
        format!("request:{}:", metric.name())
    }

    pub const METHOD_PREFIX: &'static str = "method:";
    pub const SYSTEM_PREFIX: &'static str = "system:";

    pub fn route(&self) -> Option<&str> {
        match self {
            Self::Request { route, .. } => Some(route),
            _ => None,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System(metric) => write!(f, "system:{}", metric.name()),
            Self::Request { route, metric } => write!(f, "request:{}:{route}", metric.name()),
            Self::Method(method) => write!(f, "method:{method}"),
        }
    }
}

impl FromStr for SeriesKey {
    type Err = MetricsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let corrupt = || MetricsError::BackendCorrupt {
            series_key: raw.to_string(),
            reason: "unrecognised series key".into(),
        };

        if let Some(name) = raw.strip_prefix(Self::SYSTEM_PREFIX) {
            return SystemMetric::from_name(name).map(Self::System).ok_or_else(corrupt);
        }
        if let Some(method) = raw.strip_prefix(Self::METHOD_PREFIX) {
            if method.is_empty() {
                return Err(corrupt());
            }
            return Ok(Self::Method(method.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("request:") {
            let (metric, route) = rest.split_once(':').ok_or_else(corrupt)?;
            let metric = RequestMetric::from_name(metric).ok_or_else(corrupt)?;
            return Ok(Self::Request {
                route: route.to_string(),
                metric,
            });
        }
        Err(corrupt())
    }
}

impl Serialize for SeriesKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SeriesKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn series_keys_round_trip_through_text() {
        let keys = [
            SeriesKey::System(SystemMetric::MemoryAvailableMb),
            SeriesKey::request("/api/users/:id", RequestMetric::Latency),
            SeriesKey::Method("PATCH".into()),
        ];
        for key in keys {
            let text = key.to_string();
            assert_eq!(text.parse::<SeriesKey>().unwrap(), key);
        }
        assert_eq!(
            SeriesKey::request("/a:b", RequestMetric::BytesOut).to_string(),
            "request:bytes_out:/a:b"
        );
        assert!("bogus:thing".parse::<SeriesKey>().is_err());
        assert!("request:nope:/x".parse::<SeriesKey>().is_err());
    }

    #[test]
    fn status_classes_cover_http_range() {
        assert_eq!(StatusClass::from_code(200), Some(StatusClass::Success));
        assert_eq!(StatusClass::from_code(404), Some(StatusClass::ClientError));
        assert_eq!(StatusClass::from_code(503), Some(StatusClass::ServerError));
        assert_eq!(StatusClass::from_code(99), None);
        assert_eq!(StatusClass::from_code(600), None);
        assert!(StatusClass::ServerError.is_error());
        assert!(!StatusClass::Redirection.is_error());
    }

    #[test]
    fn request_sample_fans_out_to_route_and_method_series() {
        let sample = Sample::request(
            at(100),
            RequestSample {
                route: Some("/ping".into()),
                method: Some("get".into()),
                status_code: Some(500),
                duration_seconds: 0.25,
                bytes_in: 10,
                bytes_out: 20,
            },
        );
        let obs = sample.observations();
        assert_eq!(obs.len(), 4);
        assert_eq!(obs[0].key, SeriesKey::request("/ping", RequestMetric::Latency));
        assert_eq!(obs[0].status, Some(StatusClass::ServerError));
        assert_eq!(obs[2].value, 20.0);
        assert_eq!(obs[3].key, SeriesKey::Method("GET".into()));
    }

    #[test]
    fn missing_route_is_attributed_to_unknown() {
        let sample = Sample::request(
            at(0),
            RequestSample {
                route: None,
                method: None,
                status_code: None,
                duration_seconds: 0.0,
                bytes_in: 0,
                bytes_out: 0,
            },
        );
        let obs = sample.observations();
        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0].key.route(), Some(UNKNOWN_ROUTE));
    }

    #[test]
    fn negative_duration_is_invalid() {
        let sample = Sample::request(
            at(0),
            RequestSample {
                route: None,
                method: None,
                status_code: Some(200),
                duration_seconds: -1.0,
                bytes_in: 0,
                bytes_out: 0,
            },
        );
        assert!(matches!(sample.validate(), Err(MetricsError::InvalidSample(_))));
    }

    #[test]
    fn system_sample_skips_missing_readings() {
        let sample = Sample::system(
            at(0),
            SystemSample {
                cpu_percent: Some(12.5),
                net_recv_bytes: Some(f64::NAN),
                ..Default::default()
            },
        );
        let err = sample.validate().unwrap_err();
        assert!(err.to_string().contains("network_io_recv reading NaN"), "{err}");

        let sample = Sample::system(
            at(0),
            SystemSample {
                cpu_percent: Some(12.5),
                ..Default::default()
            },
        );
        assert!(sample.validate().is_ok());
        assert_eq!(
            sample.observations()[0].key,
            SeriesKey::System(SystemMetric::CpuPercent)
        );
    }
}
