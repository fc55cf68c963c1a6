//! Application Catalog
//!
//! Lists the applications a user can choose to route through the tunnel.
//! OS enumeration belongs to the platform adapter; this module only defines
//! the record, the lookup seam and the filtering rules.

use serde::{Deserialize, Serialize};

/// Installed application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub package_name: String,
    pub app_name: String,
    #[serde(default)]
    pub is_system_app: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_base64: Option<String>,
}

impl AppInfo {
    pub fn new(package_name: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            app_name: app_name.into(),
            is_system_app: false,
            icon_base64: None,
        }
    }
}

/// Source of installed applications
pub trait AppCatalog: Send + Sync {
    fn installed_apps(&self) -> Result<Vec<AppInfo>, CatalogError>;

    fn is_installed(&self, package_name: &str) -> Result<bool, CatalogError> {
        Ok(self
            .installed_apps()?
            .iter()
            .any(|app| app.package_name == package_name))
    }
}

/// Catalog backed by a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    apps: Vec<AppInfo>,
}

impl StaticCatalog {
    pub fn new(apps: Vec<AppInfo>) -> Self {
        Self { apps }
    }

    /// Well-known apps, used when the platform cannot enumerate
    pub fn popular() -> Self {
        const POPULAR: &[(&str, &str)] = &[
            ("com.whatsapp", "WhatsApp"),
            ("com.instagram.android", "Instagram"),
            ("com.facebook.katana", "Facebook"),
            ("com.google.android.youtube", "YouTube"),
            ("com.netflix.mediaclient", "Netflix"),
            ("com.spotify.music", "Spotify"),
            ("com.twitter.android", "Twitter"),
            ("com.zhiliaoapp.musically", "TikTok"),
            ("org.telegram.messenger", "Telegram"),
            ("com.android.chrome", "Chrome"),
            ("com.snapchat.android", "Snapchat"),
            ("com.discord", "Discord"),
        ];

        Self::new(
            POPULAR
                .iter()
                .map(|(package, name)| AppInfo::new(*package, *name))
                .collect(),
        )
    }
}

impl AppCatalog for StaticCatalog {
    fn installed_apps(&self) -> Result<Vec<AppInfo>, CatalogError> {
        Ok(self.apps.clone())
    }
}

/// Apps a user may select: no system apps, not the manager itself, sorted by name
pub fn selectable_apps(apps: Vec<AppInfo>, self_identifier: &str) -> Vec<AppInfo> {
    let mut apps: Vec<AppInfo> = apps
        .into_iter()
        .filter(|app| !app.is_system_app && app.package_name != self_identifier)
        .collect();
    apps.sort_by(|a, b| {
        a.app_name
            .to_lowercase()
            .cmp(&b.app_name.to_lowercase())
            .then_with(|| a.package_name.cmp(&b.package_name))
    });
    apps
}

/// Catalog errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Application enumeration unavailable: {0}")]
    Unavailable(String),
}
