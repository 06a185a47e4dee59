//! Palworld game title: REST API models, the info → metrics → players poll
//! cycle, and the server's `PalWorldSettings.ini`.

pub mod settings;

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::api_client::ApiClient;
use crate::config::ServerDefinition;
use crate::error::ApiError;
use crate::monitor::{GameTitle, ServerModel};

pub use settings::PalworldSettings;

/// Response of `GET /info`. Field names are already lower-cased by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PalworldInfo {
    pub version: String,
    pub servername: String,
    pub description: String,
    pub worldguid: String,
}

/// Response of `GET /metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PalworldStatus {
    pub serverfps: i32,
    pub currentplayernum: i32,
    pub serverframetime: f64,
    pub maxplayernum: i32,
    pub uptime: u64,
    pub days: i32,
}

impl PalworldStatus {
    pub fn uptime_formatted(&self) -> String {
        format_uptime(self.uptime)
    }

    pub fn player_count_display(&self) -> String {
        format!("{}/{}", self.currentplayernum, self.maxplayernum)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PalworldUser {
    pub name: String,
    pub accountname: String,
    pub playerid: String,
    pub userid: String,
    pub ip: String,
    pub ping: f64,
    pub location_x: f64,
    pub location_y: f64,
    pub level: i32,
    pub building_count: i32,
}

impl PalworldUser {
    pub fn formatted_location(&self) -> String {
        format!("{:.2}, {:.2}", self.location_x, self.location_y)
    }

    pub fn short_player_id(&self) -> String {
        shorten_id(&self.playerid)
    }

    pub fn short_user_id(&self) -> String {
        shorten_id(&self.userid)
    }
}

/// Response of `GET /players`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlayersResponse {
    pub players: Vec<PalworldUser>,
}

/// Live model of one Palworld server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PalworldModel {
    pub info: PalworldInfo,
    pub status: Option<PalworldStatus>,
    pub users: Vec<PalworldUser>,
}

impl PalworldModel {
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    pub fn uptime_display(&self) -> String {
        self.status
            .as_ref()
            .map(PalworldStatus::uptime_formatted)
            .unwrap_or_else(|| "Offline".to_string())
    }

    pub fn player_count_display(&self) -> Option<String> {
        self.status.as_ref().map(PalworldStatus::player_count_display)
    }

    pub fn server_identifier(&self) -> String {
        format!("{} ({})", self.info.servername, self.info.worldguid)
    }
}

impl ServerModel for PalworldModel {
    fn is_online(&self) -> bool {
        self.status.is_some()
    }

    fn mark_offline(&mut self) {
        self.status = None;
        self.users.clear();
    }
}

#[derive(Serialize)]
struct UserView<'a> {
    #[serde(flatten)]
    user: &'a PalworldUser,
    formatted_location: String,
    short_player_id: String,
    short_user_id: String,
}

#[derive(Serialize)]
struct StatusView<'a> {
    #[serde(flatten)]
    status: &'a PalworldStatus,
    uptime_formatted: String,
    player_count_display: String,
}

// Serialized with the derived values so dashboards need no formatting logic.
impl Serialize for PalworldModel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let status = self.status.as_ref().map(|s| StatusView {
            status: s,
            uptime_formatted: s.uptime_formatted(),
            player_count_display: s.player_count_display(),
        });
        let users: Vec<UserView<'_>> = self
            .users
            .iter()
            .map(|u| UserView {
                user: u,
                formatted_location: u.formatted_location(),
                short_player_id: u.short_player_id(),
                short_user_id: u.short_user_id(),
            })
            .collect();

        let mut s = serializer.serialize_struct("PalworldModel", 8)?;
        s.serialize_field("info", &self.info)?;
        s.serialize_field("status", &status)?;
        s.serialize_field("users", &users)?;
        s.serialize_field("is_online", &self.is_online())?;
        s.serialize_field("online_count", &self.online_count())?;
        s.serialize_field("uptime_display", &self.uptime_display())?;
        s.serialize_field("player_count_display", &self.player_count_display())?;
        s.serialize_field("server_identifier", &self.server_identifier())?;
        s.end()
    }
}

/// `"<d>d <h>h <m>m <s>s"` with zero-valued leading components omitted.
pub fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn shorten_id(id: &str) -> String {
    if id.chars().count() > 8 {
        let head: String = id.chars().take(8).collect();
        format!("{}...", head)
    } else {
        id.to_string()
    }
}

/// Palworld capability set for the monitoring engine. Owns the server's
/// settings file.
pub struct Palworld {
    settings_path: PathBuf,
    settings: RwLock<PalworldSettings>,
}

impl Palworld {
    pub fn new(definition: &ServerDefinition) -> Self {
        Self::with_settings_path(settings::settings_path(Path::new(&definition.folder_path)))
    }

    pub fn with_settings_path(settings_path: PathBuf) -> Self {
        Self {
            settings_path,
            settings: RwLock::new(PalworldSettings::default()),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub async fn settings(&self) -> PalworldSettings {
        self.settings.read().await.clone()
    }

    pub async fn reload_settings(&self) -> anyhow::Result<PalworldSettings> {
        let loaded = settings::load_settings(&self.settings_path).await?;
        *self.settings.write().await = loaded.clone();
        Ok(loaded)
    }

    /// Persist and adopt new settings. The server reads them on its next boot.
    pub async fn save_settings(&self, updated: PalworldSettings) -> anyhow::Result<()> {
        settings::save_settings(&self.settings_path, &updated).await?;
        *self.settings.write().await = updated;
        tracing::info!("Saved settings to {}", self.settings_path.display());
        Ok(())
    }
}

impl GameTitle for Palworld {
    type Model = PalworldModel;

    fn initialize<'a>(&'a self, definition: &'a ServerDefinition) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.reload_settings().await?;
            tracing::info!(
                "Loaded settings for server '{}' from {}",
                definition.id,
                self.settings_path.display()
            );
            Ok(())
        })
    }

    fn poll_once<'a>(
        &'a self,
        client: &'a ApiClient,
        model: &'a mut PalworldModel,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async move {
            model.info = client.get::<PalworldInfo>("info", &[]).await?;
            model.status = Some(client.get::<PalworldStatus>("metrics", &[]).await?);
            let players: PlayersResponse = client.get("players", &[]).await?;
            model.users = players.players;
            Ok(())
        })
    }

    fn on_process_stopped<'a>(&'a self, definition: &'a ServerDefinition) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!("Palworld server '{}' stopped", definition.id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_omits_leading_zero_components() {
        assert_eq!(format_uptime(3661), "1h 1m 1s");
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(60), "1m 0s");
        assert_eq!(format_uptime(3600), "1h 0m 0s");
        assert_eq!(format_uptime(90_061), "1d 1h 1m 1s");
        assert_eq!(format_uptime(86_400), "1d 0h 0m 0s");
    }

    #[test]
    fn derived_values() {
        let user = PalworldUser {
            playerid: "0123456789abcdef".into(),
            userid: "steam_1".into(),
            location_x: 12.345,
            location_y: -3.0,
            ..Default::default()
        };
        assert_eq!(user.short_player_id(), "01234567...");
        assert_eq!(user.short_user_id(), "steam_1");
        assert_eq!(user.formatted_location(), "12.35, -3.00");

        let mut model = PalworldModel {
            info: PalworldInfo {
                servername: "Home".into(),
                worldguid: "ABC".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!model.is_online());
        assert_eq!(model.uptime_display(), "Offline");
        assert_eq!(model.server_identifier(), "Home (ABC)");

        model.status = Some(PalworldStatus {
            currentplayernum: 3,
            maxplayernum: 32,
            uptime: 61,
            ..Default::default()
        });
        model.users = vec![user];
        assert!(model.is_online());
        assert_eq!(model.uptime_display(), "1m 1s");
        assert_eq!(model.player_count_display().as_deref(), Some("3/32"));

        model.mark_offline();
        assert!(!model.is_online());
        assert_eq!(model.online_count(), 0);
        assert_eq!(model.info.servername, "Home");
    }

    #[test]
    fn model_serializes_derived_fields() {
        let model = PalworldModel {
            status: Some(PalworldStatus {
                uptime: 3661,
                ..Default::default()
            }),
            users: vec![PalworldUser::default(), PalworldUser::default()],
            ..Default::default()
        };
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["is_online"], true);
        assert_eq!(json["online_count"], 2);
        assert_eq!(json["uptime_display"], "1h 1m 1s");
        assert_eq!(json["status"]["uptime_formatted"], "1h 1m 1s");
        assert_eq!(json["users"][0]["formatted_location"], "0.00, 0.00");
    }
}
