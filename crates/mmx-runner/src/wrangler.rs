//! Client for the RECOVER predictor service that builds MERRA rasters for a
//! site on request.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, Utc};
use mmx_core::{atomic_write_bytes, BoundingBox};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_SERVER: &str = "recoverdss.us";
pub const MERRA_MAX_PREDICTOR: &str = "MERRA Max";
const SERVICE_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WranglerSettings {
    pub server: String,
    pub user: Option<String>,
    pub key: Option<String>,
}

impl Default for WranglerSettings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            user: None,
            key: None,
        }
    }
}

impl WranglerSettings {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            server: non_empty("MMX_WRANGLER_SERVER").unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            user: non_empty("MMX_WRANGLER_USER"),
            key: non_empty("MMX_WRANGLER_KEY"),
        }
    }

    pub fn credentials(&self) -> Result<Credentials> {
        match (&self.user, &self.key) {
            (Some(user), Some(key)) => Ok(Credentials {
                user: user.clone(),
                key: key.clone(),
            }),
            _ => bail!("ordering predictors needs MMX_WRANGLER_USER and MMX_WRANGLER_KEY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub key: String,
}

/// Service reply. Transport failures are reported through the same shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub msg: Value,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl ApiResponse {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: Value::String(msg.into()),
            message: None,
            state: Some("FAILED".to_string()),
        }
    }

    pub fn msg_text(&self) -> String {
        match &self.msg {
            Value::String(s) => s.clone(),
            Value::Null => self.message.clone().unwrap_or_default(),
            other => other.to_string(),
        }
    }

    fn state_is(&self, code: &str) -> bool {
        self.state.as_deref() == Some(code)
    }

    /// A previous attempt at the same predictor is stuck and must be deleted
    /// before the service accepts it again.
    fn is_stale_failure(&self) -> bool {
        self.state_is("FLD")
            && self
                .message
                .as_deref()
                .map_or(false, |m| m.contains("failed"))
    }
}

pub trait PredictorService {
    fn call(&self, command: &str, args: &[(&str, String)]) -> ApiResponse;
    fn download(&self, command: &str, args: &[(&str, String)], dest: &Path) -> Result<()>;
}

pub struct HttpPredictorService {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpPredictorService {
    pub fn new(server: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("failed to build HTTP client")?;
        let base = if server.starts_with("http://") || server.starts_with("https://") {
            server.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", server.trim_end_matches('/'))
        };
        Ok(Self {
            client,
            base_url: format!("{}/api", base),
        })
    }

    pub fn url(&self, command: &str) -> String {
        format!("{}/{}", self.base_url, command)
    }
}

impl PredictorService for HttpPredictorService {
    fn call(&self, command: &str, args: &[(&str, String)]) -> ApiResponse {
        let resp = match self.client.get(self.url(command)).query(args).send() {
            Ok(resp) => resp,
            Err(e) => return ApiResponse::failed(format!("network error: {}", e)),
        };
        let status = resp.status();
        if !status.is_success() {
            return ApiResponse::failed(format!("HTTP error: {}", status));
        }
        resp.json::<ApiResponse>()
            .unwrap_or_else(|e| ApiResponse::failed(format!("bad response body: {}", e)))
    }

    fn download(&self, command: &str, args: &[(&str, String)], dest: &Path) -> Result<()> {
        let resp = self
            .client
            .get(self.url(command))
            .query(args)
            .send()
            .with_context(|| format!("{} request failed", command))?
            .error_for_status()
            .with_context(|| format!("{} was refused", command))?;
        let bytes = resp.bytes().context("failed to read download body")?;
        atomic_write_bytes(dest, &bytes)?;
        info!(path = %dest.display(), bytes = bytes.len(), "downloaded");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(2 * 24 * 60 * 60),
        }
    }
}

/// Orders a predictor-less site covering `extent` and returns its id.
pub fn create_empty_site(
    service: &dyn PredictorService,
    creds: &Credentials,
    extent: &BoundingBox,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<String> {
    let mut args = vec![
        ("ulx", extent.ulx.to_string()),
        ("uly", extent.uly.to_string()),
        ("lrx", extent.lrx.to_string()),
        ("lry", extent.lry.to_string()),
        ("epsg", extent.epsg.to_string()),
        ("siteName", format!("WRANGLE_EMPTY_SITE-{}", Utc::now().timestamp())),
        ("key", creds.key.clone()),
        ("user", creds.user.clone()),
        ("predictors", "[]".to_string()),
    ];
    if let Some(d) = start {
        args.push(("startDate", d.format(SERVICE_DATE_FORMAT).to_string()));
    }
    if let Some(d) = end {
        args.push(("endDate", d.format(SERVICE_DATE_FORMAT).to_string()));
    }

    let resp = service.call("order", &args);
    if !resp.success {
        bail!("unable to create site: {}", resp.msg_text());
    }
    let site = resp.msg_text();
    info!(site = %site, "created site");
    Ok(site)
}

/// Adds `predictor` to `site`, waits for the service to build it and
/// downloads the archive as `<dest_dir>/<predictor>.zip`.
pub fn order_predictor(
    service: &dyn PredictorService,
    creds: &Credentials,
    site: &str,
    predictor: &str,
    dest_dir: &Path,
    policy: &PollPolicy,
) -> Result<PathBuf> {
    let args = vec![
        ("site", site.to_string()),
        ("key", creds.key.clone()),
        ("user", creds.user.clone()),
        ("predictorName", predictor.to_string()),
    ];

    let mut resubmitted = false;
    loop {
        let resp = service.call("addPredictor", &args);
        if resp.success {
            info!(site, predictor, msg = %resp.msg_text(), "predictor requested");
            break;
        }
        if resp.is_stale_failure() && !resubmitted {
            warn!(site, predictor, "previous request failed, deleting and resubmitting");
            let deleted = service.call("deletePredictor", &args);
            debug!(success = deleted.success, msg = %deleted.msg_text(), "deletePredictor");
            resubmitted = true;
            continue;
        }
        bail!("unable to add {} to site {}: {}", predictor, site, resp.msg_text());
    }

    let started = Instant::now();
    loop {
        let resp = service.call("predictorStatus", &args);
        if resp.state_is("CPT") {
            break;
        }
        if resp.state_is("FLD") {
            bail!("service failed to build {}: {}", predictor, resp.msg_text());
        }
        if started.elapsed() >= policy.max_wait {
            return Err(anyhow!(
                "{} was not ready after {:?} (last state {:?})",
                predictor,
                policy.max_wait,
                resp.state
            ));
        }
        debug!(state = ?resp.state, "waiting for predictor");
        thread::sleep(policy.interval);
    }

    let dest = dest_dir.join(format!("{}.zip", predictor));
    let download_args = vec![
        ("site", site.to_string()),
        ("predictor", predictor.to_string()),
        ("key", creds.key.clone()),
        ("user", creds.user.clone()),
    ];
    service.download("downloadPredictor", &download_args, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;

    struct Scripted {
        replies: RefCell<VecDeque<ApiResponse>>,
        calls: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Value>) -> Self {
            Self {
                replies: RefCell::new(
                    replies
                        .into_iter()
                        .map(|v| serde_json::from_value(v).expect("reply"))
                        .collect(),
                ),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl PredictorService for Scripted {
        fn call(&self, command: &str, _args: &[(&str, String)]) -> ApiResponse {
            self.calls.borrow_mut().push(command.to_string());
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| ApiResponse::failed("script exhausted"))
        }

        fn download(&self, command: &str, _args: &[(&str, String)], dest: &Path) -> Result<()> {
            self.calls.borrow_mut().push(command.to_string());
            fs::write(dest, b"zip")?;
            Ok(())
        }
    }

    fn creds() -> Credentials {
        Credentials {
            user: "u".to_string(),
            key: "k".to_string(),
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy {
            interval: Duration::ZERO,
            max_wait: Duration::from_secs(60),
        }
    }

    #[test]
    fn waits_for_completion_then_downloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = Scripted::new(vec![
            json!({"success": true, "msg": "queued"}),
            json!({"success": true, "state": "PND"}),
            json!({"success": true, "state": "RUN"}),
            json!({"success": true, "state": "CPT"}),
        ]);
        let zip = order_predictor(&svc, &creds(), "42", MERRA_MAX_PREDICTOR, dir.path(), &fast())
            .expect("order");
        assert_eq!(zip, dir.path().join("MERRA Max.zip"));
        assert!(zip.is_file());
        assert_eq!(
            *svc.calls.borrow(),
            vec![
                "addPredictor",
                "predictorStatus",
                "predictorStatus",
                "predictorStatus",
                "downloadPredictor"
            ]
        );
    }

    #[test]
    fn stale_failure_is_resubmitted_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = Scripted::new(vec![
            json!({"success": false, "state": "FLD", "message": "processing failed"}),
            json!({"success": true}),
            json!({"success": true, "msg": "queued"}),
            json!({"success": true, "state": "CPT"}),
        ]);
        order_predictor(&svc, &creds(), "42", "MERRA Max", dir.path(), &fast()).expect("order");
        assert_eq!(svc.calls.borrow()[..3], ["addPredictor", "deletePredictor", "addPredictor"]);

        let svc = Scripted::new(vec![
            json!({"success": false, "state": "FLD", "message": "failed"}),
            json!({"success": true}),
            json!({"success": false, "state": "FLD", "message": "failed again"}),
        ]);
        let err = order_predictor(&svc, &creds(), "42", "MERRA Max", dir.path(), &fast())
            .expect_err("second failure is final");
        assert!(err.to_string().contains("failed again"), "{}", err);
    }

    #[test]
    fn build_failure_stops_polling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = Scripted::new(vec![
            json!({"success": true}),
            json!({"success": true, "state": "FLD", "msg": "no data"}),
        ]);
        let err = order_predictor(&svc, &creds(), "1", "MERRA Max", dir.path(), &fast())
            .expect_err("FLD");
        assert!(err.to_string().contains("no data"));
        assert!(!dir.path().join("MERRA Max.zip").exists());
    }

    #[test]
    fn polling_gives_up_after_max_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = Scripted::new(vec![
            json!({"success": true}),
            json!({"success": true, "state": "RUN"}),
        ]);
        let policy = PollPolicy {
            interval: Duration::ZERO,
            max_wait: Duration::ZERO,
        };
        let err = order_predictor(&svc, &creds(), "1", "MERRA Max", dir.path(), &policy)
            .expect_err("timeout");
        assert!(err.to_string().contains("not ready"), "{}", err);
    }

    #[test]
    fn site_id_comes_back_in_msg() {
        let svc = Scripted::new(vec![json!({"success": true, "msg": 1234})]);
        let extent = BoundingBox {
            ulx: -120.0,
            uly: 45.0,
            lrx: -110.0,
            lry: 35.0,
            epsg: 4326,
        };
        let site = create_empty_site(&svc, &creds(), &extent, None, None).expect("site");
        assert_eq!(site, "1234");

        let svc = Scripted::new(vec![json!({"success": false, "msg": "bad key"})]);
        assert!(create_empty_site(&svc, &creds(), &extent, None, None).is_err());
    }

    #[test]
    fn credentials_are_required() {
        let settings = WranglerSettings::default();
        assert!(settings.credentials().is_err());
        let settings = WranglerSettings {
            user: Some("u".to_string()),
            key: Some("k".to_string()),
            ..WranglerSettings::default()
        };
        assert_eq!(settings.credentials().expect("creds"), creds());
    }

    #[test]
    fn service_urls_default_to_https() {
        let svc = HttpPredictorService::new("example.org/").expect("client");
        assert_eq!(svc.url("order"), "https://example.org/api/order");
        let svc = HttpPredictorService::new("http://localhost:8080").expect("client");
        assert_eq!(svc.url("order"), "http://localhost:8080/api/order");
    }
}
