//! MAC OUI to vendor-name mapping.
//!
//! The full IEEE registry is downloaded into a local cache file and reloaded
//! from there; whenever that fails a small built-in table is used instead.
//! Lookups only ever read the in-memory map.

use crate::error::ProbeError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

pub const DEFAULT_OUI_URL: &str = "https://standards-oui.ieee.org/oui/oui.csv";
pub const DEFAULT_CACHE_FILE: &str = "oui_cache.csv";
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const MAX_DOWNLOAD_BYTES: u64 = 10 * 1024 * 1024;

const HEADER_MARKER: &str = "Registry,Assignment";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
// A parse yielding fewer entries than this is treated as a broken file.
const MIN_ENTRIES: usize = 100;

const FALLBACK: &[(&str, &str)] = &[
    ("00-50-56", "VMware"),
    ("00-0C-29", "VMware"),
    ("00-15-5D", "Hyper-V"),
    ("00-00-0C", "Cisco"),
    ("B8-27-EB", "Raspberry Pi"),
    ("DC-A6-32", "Raspberry Pi"),
];

// Substring (case-insensitive) -> short display name, first match wins.
const CANONICAL_NAMES: &[(&str, &str)] = &[
    ("apple", "Apple"),
    ("samsung", "Samsung"),
    ("ubiquiti", "Ubiquiti"),
    ("google", "Google"),
    ("microsoft", "Microsoft"),
    ("intel ", "Intel"),
    ("dell ", "Dell"),
    ("hewlett packard", "HP"),
    ("hp inc", "HP"),
    ("cisco", "Cisco"),
    ("netgear", "Netgear"),
    ("tp-link", "TP-Link"),
    ("linksys", "Linksys"),
    ("amazon", "Amazon"),
    ("sonos", "Sonos"),
    ("roku", "Roku"),
    ("raspberry pi", "Raspberry Pi"),
    ("espressif", "Espressif"),
    ("asus", "ASUS"),
    ("lenovo", "Lenovo"),
    ("aruba", "Aruba"),
    ("huawei", "Huawei"),
    ("xiaomi", "Xiaomi"),
    ("vmware", "VMware"),
    ("hyper-v", "Hyper-V"),
    ("sony", "Sony"),
    ("lg elec", "LG"),
    ("motorola", "Motorola"),
    ("d-link", "D-Link"),
    ("belkin", "Belkin"),
    ("nvidia", "Nvidia"),
    ("synology", "Synology"),
    ("qnap", "QNAP"),
    ("nest labs", "Nest"),
    ("ring llc", "Ring"),
    ("oneplus", "OnePlus"),
    ("wyze", "Wyze"),
    ("hon hai", "Foxconn"),
    ("foxconn", "Foxconn"),
    ("murata", "Murata"),
    ("realtek", "Realtek"),
    ("broadcom", "Broadcom"),
    ("qualcomm", "Qualcomm"),
    ("mediatek", "MediaTek"),
];

const LEGAL_SUFFIXES: &[&str] = &[" inc", " llc", " corp", " ltd", " co.", " gmbh", " s.a"];

/// Where the currently loaded table came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorSource {
    Downloaded,
    Cache,
    Fallback,
}

pub struct VendorDatabase {
    map: RwLock<Arc<HashMap<String, String>>>,
    cache_path: PathBuf,
    source_url: String,
}

impl VendorDatabase {
    /// Create a database holding only the built-in table. Call
    /// [`VendorDatabase::refresh`] to load the full registry.
    pub fn new(cache_path: impl Into<PathBuf>, source_url: impl Into<String>) -> Self {
        Self {
            map: RwLock::new(Arc::new(fallback_table())),
            cache_path: cache_path.into(),
            source_url: source_url.into(),
        }
    }

    /// Load the cache if there is one and, with `auto_refresh`, bring the
    /// table up to date on a background task. Lookups use the cached or
    /// built-in table until the refresh lands.
    pub async fn open(
        cache_path: impl Into<PathBuf>,
        source_url: impl Into<String>,
        auto_refresh: bool,
    ) -> Arc<Self> {
        let db = Arc::new(Self::new(cache_path, source_url));
        if let Err(e) = db.load_cache().await {
            tracing::info!(error = %e, "no usable OUI cache, using built-in vendor table");
        }
        if auto_refresh {
            let background = db.clone();
            tokio::spawn(async move {
                background.refresh().await;
            });
        }
        db
    }

    /// A database that never touches disk or network unless refreshed.
    pub fn builtin() -> Self {
        Self::new(DEFAULT_CACHE_FILE, DEFAULT_OUI_URL)
    }

    /// Vendor for a MAC address such as `AB-CD-EF-12-34-56`, or `""`.
    pub fn lookup(&self, mac: &str) -> String {
        let Some(oui) = oui_key(mac) else {
            return String::new();
        };
        self.snapshot().get(&oui).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<HashMap<String, String>> {
        match self.map.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, map: HashMap<String, String>) {
        let map = Arc::new(map);
        match self.map.write() {
            Ok(mut guard) => *guard = map,
            Err(poisoned) => *poisoned.into_inner() = map,
        }
    }

    /// Bring the table up to date: download when the cache is missing or
    /// older than [`CACHE_MAX_AGE`], then load the cache. Any failure leaves
    /// the built-in table in place.
    pub async fn refresh(&self) -> VendorSource {
        self.update(false).await
    }

    /// Like [`VendorDatabase::refresh`] but downloads even when the cache is
    /// fresh. The old cache is kept if the download fails.
    pub async fn force_refresh(&self) -> VendorSource {
        self.update(true).await
    }

    async fn update(&self, force: bool) -> VendorSource {
        let mut source = VendorSource::Cache;
        if force || !cache_is_fresh(&self.cache_path).await {
            match self.download().await {
                Ok(()) => source = VendorSource::Downloaded,
                Err(e) => {
                    tracing::warn!(url = %self.source_url, error = %e, "OUI download failed");
                }
            }
        }
        match self.load_cache().await {
            Ok(count) => {
                tracing::info!(entries = count, ?source, "vendor database loaded");
                source
            }
            Err(e) => {
                tracing::warn!(error = %e, "using built-in vendor table");
                self.install(fallback_table());
                VendorSource::Fallback
            }
        }
    }

    async fn download(&self) -> Result<(), ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        let resp = client
            .get(&self.source_url)
            .send()
            .await?
            .error_for_status()?;
        if resp.content_length().unwrap_or(0) > MAX_DOWNLOAD_BYTES {
            return Err(ProbeError::VendorData("registry file is too large".into()));
        }
        let body = resp.bytes().await?;
        if body.len() as u64 > MAX_DOWNLOAD_BYTES {
            return Err(ProbeError::VendorData("registry file is too large".into()));
        }
        let text = String::from_utf8_lossy(&body);
        if !text.contains(HEADER_MARKER) {
            return Err(ProbeError::VendorData("unexpected registry format".into()));
        }
        if let Some(parent) = self.cache_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.cache_path, text.as_bytes()).await?;
        Ok(())
    }

    /// Load the cache file, replacing the current table. Returns the entry count.
    pub async fn load_cache(&self) -> Result<usize, ProbeError> {
        let text = tokio::fs::read_to_string(&self.cache_path).await?;
        let map = parse_oui_csv(&text);
        if map.len() <= MIN_ENTRIES {
            return Err(ProbeError::VendorData(format!(
                "only {} entries in {}",
                map.len(),
                self.cache_path.display()
            )));
        }
        let count = map.len();
        self.install(map);
        Ok(count)
    }
}

async fn cache_is_fresh(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .map(|age| age < CACHE_MAX_AGE)
        .unwrap_or(false)
}

/// First three octets of a MAC in `AA-BB-CC` form.
fn oui_key(mac: &str) -> Option<String> {
    let mac = mac.trim();
    if mac.is_empty() || mac == crate::types::NOT_AVAILABLE {
        return None;
    }
    let normalized = mac.replace(':', "-").to_ascii_uppercase();
    let parts: Vec<&str> = normalized.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    Some(format!("{}-{}-{}", parts[0], parts[1], parts[2]))
}

/// Parse the IEEE registry CSV (`Registry,Assignment,Organization Name,...`).
pub fn parse_oui_csv(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    for record in reader.records().flatten() {
        let (Some(assignment), Some(org)) = (record.get(1), record.get(2)) else {
            continue;
        };
        let assignment = assignment.trim().to_ascii_uppercase();
        if assignment.len() != 6 || !assignment.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let oui = format!(
            "{}-{}-{}",
            &assignment[0..2],
            &assignment[2..4],
            &assignment[4..6]
        );
        map.entry(oui)
            .or_insert_with(|| shorten_vendor_name(org.trim().trim_matches('"')));
    }
    map
}

/// Map well-known organizations to short names and trim the rest.
pub fn shorten_vendor_name(name: &str) -> String {
    let lower = name.to_lowercase();
    if let Some((_, short)) = CANONICAL_NAMES.iter().find(|(k, _)| lower.contains(k)) {
        return short.to_string();
    }
    if name.chars().count() <= 20 {
        return name.to_string();
    }
    if let Some(cut) = name.find([',', ';']) {
        if cut > 0 && cut <= 25 {
            return name[..cut].trim().to_string();
        }
    }
    for suffix in LEGAL_SUFFIXES {
        if let Some(idx) = find_ascii_ignore_case(name, suffix) {
            if idx > 0 && idx <= 25 {
                return name[..idx].trim().to_string();
            }
        }
    }
    if name.chars().count() > 25 {
        let head: String = name.chars().take(22).collect();
        return format!("{head}...");
    }
    name.to_string()
}

/// Byte offset of `needle` in `haystack`, matching ASCII case-insensitively.
/// Offsets always fall on char boundaries of `haystack`.
fn find_ascii_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack.char_indices().map(|(i, _)| i).find(|&i| {
        haystack
            .get(i..i + needle.len())
            .is_some_and(|window| window.eq_ignore_ascii_case(needle))
    })
}

pub fn fallback_table() -> HashMap<String, String> {
    FALLBACK
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_csv(extra_rows: usize) -> String {
        let mut s = String::from("Registry,Assignment,Organization Name,Organization Address\n");
        s.push_str("MA-L,ACDE48,\"Apple, Inc.\",\"1 Infinite Loop, Cupertino\"\n");
        s.push_str("MA-L,001C42,Parallels International GmbH,\"Zug, CH\"\n");
        s.push_str("MA-L,bogus,Broken Row,nowhere\n");
        for i in 0..extra_rows {
            s.push_str(&format!("MA-L,{:06X},Vendor {i},Somewhere\n", 0x100000 + i));
        }
        s
    }

    #[test]
    fn parses_registry_rows() {
        let map = parse_oui_csv(&sample_csv(3));
        assert_eq!(map.get("AC-DE-48").map(String::as_str), Some("Apple"));
        assert_eq!(
            map.get("00-1C-42").map(String::as_str),
            Some("Parallels International")
        );
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn shortens_names() {
        assert_eq!(shorten_vendor_name("Hon Hai Precision Ind. Co.,Ltd."), "Foxconn");
        assert_eq!(shorten_vendor_name("Tiny Corp"), "Tiny Corp");
        assert_eq!(shorten_vendor_name("Shenzhen Example, Ltd"), "Shenzhen Example");
        // 'İ' grows when lowercased; the cut must still land before " Ltd".
        assert_eq!(shorten_vendor_name("İZMİR TEKNİK Ltd Şirketi"), "İZMİR TEKNİK");
        assert_eq!(shorten_vendor_name("Northwind Networks GMBH Berlin"), "Northwind Networks");
        assert_eq!(
            shorten_vendor_name("Extraordinarily Long Manufacturer Name Without Suffix"),
            "Extraordinarily Long M..."
        );
    }

    #[test]
    fn lookup_uses_fallback_and_normalizes() {
        let db = VendorDatabase::builtin();
        assert_eq!(db.lookup("00-50-56-AA-BB-CC"), "VMware");
        assert_eq!(db.lookup("b8:27:eb:01:02:03"), "Raspberry Pi");
        assert_eq!(db.lookup("N/A"), "");
        assert_eq!(db.lookup("12-34"), "");
    }

    #[tokio::test]
    async fn undersized_cache_is_rejected() {
        let path = std::env::temp_dir().join(format!("oui-small-{}.csv", std::process::id()));
        tokio::fs::write(&path, sample_csv(5)).await.unwrap();
        let db = VendorDatabase::new(&path, "http://127.0.0.1:9/unused");
        assert!(db.load_cache().await.is_err());
        assert_eq!(db.lookup("00-0C-29-00-00-01"), "VMware");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn fresh_cache_replaces_table() {
        let path = std::env::temp_dir().join(format!("oui-full-{}.csv", std::process::id()));
        tokio::fs::write(&path, sample_csv(200)).await.unwrap();
        let db = VendorDatabase::new(&path, "http://127.0.0.1:9/unused");
        assert_eq!(db.refresh().await, VendorSource::Cache);
        assert_eq!(db.lookup("AC-DE-48-00-11-22"), "Apple");
        // built-in entries are gone once the registry is loaded
        assert_eq!(db.lookup("00-50-56-AA-BB-CC"), "");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn open_does_not_wait_for_download() {
        // Accepts connections but never answers.
        let stall = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/oui.csv", stall.local_addr().unwrap());
        let path = std::env::temp_dir().join(format!("oui-missing-{}.csv", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        let db = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            VendorDatabase::open(&path, url, true),
        )
        .await
        .expect("open returned before the download finished");
        assert_eq!(db.lookup("00-50-56-AA-BB-CC"), "VMware");
    }
}
