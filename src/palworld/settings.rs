use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::codec::{self, SettingField, SettingKind, SettingsSchema};
use crate::config::write_atomic;

#[cfg(windows)]
const PLATFORM_DIR: &str = "WindowsServer";
#[cfg(not(windows))]
const PLATFORM_DIR: &str = "LinuxServer";

macro_rules! setting_type {
    (Bool) => { bool };
    (Int) => { i32 };
    (Float) => { f64 };
    (Text) => { String };
}

macro_rules! setting_default {
    (Text, $default:expr) => { String::from($default) };
    ($kind:ident, $default:expr) => { $default };
}

/// Declares `PalworldSettings`, its `Default`, and the key table in one go so
/// the three can never drift apart.
macro_rules! palworld_settings {
    ($( $field:ident : $kind:ident = $default:expr => $key:literal ),* $(,)?) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct PalworldSettings {
            $( pub $field: setting_type!($kind), )*
        }

        impl Default for PalworldSettings {
            fn default() -> Self {
                Self {
                    $( $field: setting_default!($kind, $default), )*
                }
            }
        }

        fn build_fields() -> Vec<SettingField<PalworldSettings>> {
            vec![
                $(
                    SettingField {
                        key: $key,
                        kind: SettingKind::$kind,
                        get: |s| s.$field.clone().into(),
                        set: |s, v| v.try_into().map(|x| s.$field = x).is_ok(),
                    },
                )*
            ]
        }
    };
}

palworld_settings! {
    // server
    server_name: Text = "Default Palworld Server" => "ServerName",
    server_description: Text = "" => "ServerDescription",
    admin_password: Text = "" => "AdminPassword",
    server_password: Text = "" => "ServerPassword",
    public_ip: Text = "" => "PublicIP",
    public_port: Int = 8211 => "PublicPort",
    server_player_max_num: Int = 32 => "ServerPlayerMaxNum",
    rcon_enabled: Bool = false => "RCONEnabled",
    rcon_port: Int = 25575 => "RCONPort",
    rest_api_enabled: Bool = false => "RESTAPIEnabled",
    rest_api_port: Int = 8212 => "RESTAPIPort",
    region: Text = "" => "Region",
    use_auth: Bool = true => "bUseAuth",
    ban_list_url: Text = "https://api.palworldgame.com/api/banlist.txt" => "BanListURL",

    // in-game
    enable_player_to_player_damage: Bool = true => "bEnablePlayerToPlayerDamage",
    pal_egg_default_hatching_time: Float = 72.0 => "PalEggDefaultHatchingTime",
    drop_item_max_num: Int = 3000 => "DropItemMaxNum",
    base_camp_max_num: Int = 128 => "BaseCampMaxNum",
    drop_item_alive_max_hours: Float = 1.0 => "DropItemAliveMaxHours",
    auto_reset_guild_no_online_players: Bool = false => "bAutoResetGuildNoOnlinePlayers",
    auto_reset_guild_time_no_online_players: Float = 72.0 => "AutoResetGuildTimeNoOnlinePlayers",
    work_speed_rate: Float = 1.0 => "WorkSpeedRate",
    is_multiplay: Bool = false => "bIsMultiplay",
    is_pvp: Bool = false => "bIsPvP",
    can_pickup_other_guild_death_penalty_drop: Bool = false => "bCanPickupOtherGuildDeathPenaltyDrop",
    enable_non_login_penalty: Bool = true => "bEnableNonLoginPenalty",
    enable_fast_travel: Bool = true => "bEnableFastTravel",
    is_start_location_select_by_map: Bool = true => "bIsStartLocationSelectByMap",
    exist_player_after_logout: Bool = false => "bExistPlayerAfterLogout",
    enable_defense_other_guild_player: Bool = false => "bEnableDefenseOtherGuildPlayer",
    invisible_other_guild_base_camp_area_fx: Bool = false => "bInvisibleOtherGuildBaseCampAreaFX",
    build_area_limit: Bool = false => "bBuildAreaLimit",
    coop_player_max_num: Int = 4 => "CoopPlayerMaxNum",
    pal_sync_distance_from_player: Int = 15000 => "PalSyncDistanceFromPlayer",
    show_player_list: Bool = false => "bShowPlayerList",
    allow_global_palbox_export: Bool = true => "bAllowGlobalPalboxExport",
    allow_global_palbox_import: Bool = false => "bAllowGlobalPalboxImport",

    // balance
    day_time_speed_rate: Float = 1.0 => "DayTimeSpeedRate",
    night_time_speed_rate: Float = 1.0 => "NightTimeSpeedRate",
    exp_rate: Float = 1.0 => "ExpRate",
    pal_capture_rate: Float = 1.0 => "PalCaptureRate",
    pal_spawn_num_rate: Float = 1.0 => "PalSpawnNumRate",
    pal_damage_rate_attack: Float = 1.0 => "PalDamageRateAttack",
    pal_damage_rate_defense: Float = 1.0 => "PalDamageRateDefense",
    pal_stomach_decrease_rate: Float = 1.0 => "PalStomachDecreaceRate",
    pal_stamina_decrease_rate: Float = 1.0 => "PalStaminaDecreaceRate",
    pal_auto_hp_regen_rate: Float = 1.0 => "PalAutoHPRegeneRate",
    pal_auto_hp_regen_rate_in_sleep: Float = 1.0 => "PalAutoHpRegeneRateInSleep",
    player_damage_rate_attack: Float = 1.0 => "PlayerDamageRateAttack",
    player_damage_rate_defense: Float = 1.0 => "PlayerDamageRateDefense",
    player_stomach_decrease_rate: Float = 1.0 => "PlayerStomachDecreaceRate",
    player_stamina_decrease_rate: Float = 1.0 => "PlayerStaminaDecreaceRate",
    player_auto_hp_regen_rate: Float = 1.0 => "PlayerAutoHPRegeneRate",
    player_auto_hp_regen_rate_in_sleep: Float = 1.0 => "PlayerAutoHpRegeneRateInSleep",
    build_object_hp_rate: Float = 1.0 => "BuildObjectHpRate",
    build_object_damage_rate: Float = 1.0 => "BuildObjectDamageRate",
    build_object_deterioration_damage_rate: Float = 1.0 => "BuildObjectDeteriorationDamageRate",
    collection_drop_rate: Float = 1.0 => "CollectionDropRate",
    collection_object_hp_rate: Float = 1.0 => "CollectionObjectHpRate",
    collection_object_respawn_speed_rate: Float = 1.0 => "CollectionObjectRespawnSpeedRate",
    enemy_drop_item_rate: Float = 1.0 => "EnemyDropItemRate",
    item_weight_rate: Float = 1.0 => "ItemWeightRate",

    // advanced
    hardcore: Bool = false => "bHardcore",
    pal_lost: Bool = false => "bPalLost",
    character_recreate_in_hardcore: Bool = false => "bCharacterRecreateInHardcore",
    death_penalty: Text = "All" => "DeathPenalty",
    enable_invader_enemy: Bool = true => "bEnableInvaderEnemy",
    enable_predator_boss_pal: Bool = false => "EnablePredatorBossPal",
    guild_player_max_num: Int = 20 => "GuildPlayerMaxNum",
    base_camp_max_num_in_guild: Int = 3 => "BaseCampMaxNumInGuild",
    base_camp_worker_max_num: Int = 15 => "BaseCampWorkerMaxNum",
    max_building_limit_num: Int = 0 => "MaxBuildingLimitNum",
    supply_drop_span: Int = 180 => "SupplyDropSpan",
    chat_post_limit_per_minute: Int = 10 => "ChatPostLimitPerMinute",
    equipment_durability_damage_rate: Float = 1.0 => "EquipmentDurabilityDamageRate",
    item_container_force_mark_dirty_interval: Float = 1.0 => "ItemContainerForceMarkDirtyInterval",
    auto_save_span: Float = 30.0 => "AutoSaveSpan",
    server_replicate_pawn_cull_distance: Float = 15000.0 => "ServerReplicatePawnCullDistance",

    // platform
    log_format_type: Text = "Text" => "LogFormatType",
    allow_connect_platform: Text = "Steam" => "AllowConnectPlatform",
    crossplay_platforms: Text = "(Steam,Xbox,PS5,Mac)" => "CrossplayPlatforms",
}

impl SettingsSchema for PalworldSettings {
    const HEADER: &'static str = "[/Script/Pal.PalGameWorldSettings]";

    const STATIC_SETTINGS: &'static [(&'static str, &'static str)] = &[
        ("Difficulty", "None"),
        ("RandomizerType", "None"),
        ("RandomizerSeed", "\"\""),
        ("bIsRandomizerPalLevelRandom", "false"),
        ("bEnableFriendlyFire", "false"),
        ("bActiveUNKO", "false"),
        ("bEnableAimAssistPad", "true"),
        ("bEnableAimAssistKeyboard", "false"),
        ("DropItemMaxNum_UNKO", "100"),
        ("bUseBanList", "true"),
        ("bIsUseBackupSaveData", "true"),
    ];

    fn fields() -> &'static [SettingField<Self>] {
        static FIELDS: OnceLock<Vec<SettingField<PalworldSettings>>> = OnceLock::new();
        FIELDS.get_or_init(build_fields)
    }
}

impl PalworldSettings {
    pub fn from_ini(text: &str) -> Self {
        codec::parse(text)
    }

    pub fn to_ini(&self) -> String {
        codec::serialize(self)
    }
}

/// `<folder>/Pal/Saved/Config/<Platform>Server/PalWorldSettings.ini`
pub fn settings_path(folder: &Path) -> PathBuf {
    folder
        .join("Pal")
        .join("Saved")
        .join("Config")
        .join(PLATFORM_DIR)
        .join("PalWorldSettings.ini")
}

pub async fn load_settings(path: &Path) -> anyhow::Result<PalworldSettings> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(PalworldSettings::from_ini(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Settings file {} not found, using defaults", path.display());
            Ok(PalworldSettings::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub async fn save_settings(path: &Path, settings: &PalworldSettings) -> anyhow::Result<()> {
    write_atomic(path, settings.to_ini().as_bytes())
        .await
        .with_context(|| format!("Failed to save settings to {}", path.display()))
}
