//! Configuration loading (out of scope per spec.md §1, specified only
//! at its interface; implemented here per SPEC_FULL.md §A): an INI file
//! read through the `ini` crate into the flat option set spec.md §6
//! recognizes, with `PublicIP = "auto"` resolved via a one-shot HTTP
//! GET, matching `original_source/Utils/config.py`.

use crate::admission::HourWindow;
use crate::error::{Error, Result};
use ini::Ini;
use std::net::IpAddr;
use std::path::Path;

const IP_DISCOVERY_ENDPOINT: &str = "https://checkip.amazonaws.com/";

/// Recognized configuration surface (spec.md §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub public_ip: IpAddr,
    pub voip_address: String,
    pub voip_allow_list: Vec<String>,
    pub discord_bot_token: String,
    pub discord_home_guild_id: String,
    pub discord_home_voice_channel_id: String,
    pub discord_home_text_channel_id: String,
    pub welcome_message: String,
    pub incoming_call_message: String,
    /// Signed hours, e.g. `-5` for UTC-5 (spec.md §6 `Timezone.UtcOffset`).
    pub utc_offset_hours: i32,
    /// `0` means unlimited, per spec.md §6.
    pub hourly_call_limit: usize,
    pub do_not_disturb: Vec<HourWindow>,
}

fn required<'a>(ini: &'a Ini, section: &str, key: &str) -> Result<&'a str> {
    ini.section(Some(section))
        .and_then(|s| s.get(key))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("mandatory parameter \"{key}\" missing from [{section}] section")))
}

impl Config {
    /// Load and validate a config file at `path`. `PublicIP = "auto"`
    /// triggers `resolve_public_ip` before returning.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let ini = Ini::load_from_file(path.as_ref()).map_err(|e| Error::Config(e.to_string()))?;

        let public_ip_field = required(&ini, "Server", "PublicIP")?.to_string();
        let voip_address = required(&ini, "VoIP", "Address")?.to_string();
        let discord_bot_token = required(&ini, "Discord", "BotToken")?.to_string();
        let discord_home_guild_id = required(&ini, "Discord", "HomeGuildID")?.to_string();
        let discord_home_voice_channel_id = required(&ini, "Discord", "HomeVoiceChannelID")?.to_string();
        let discord_home_text_channel_id = required(&ini, "Discord", "HomeTextChannelID")?.to_string();
        let welcome_message = required(&ini, "Messages", "Welcome")?.to_string();
        let incoming_call_message = required(&ini, "Messages", "IncomingCall")?.to_string();
        let utc_offset_hours: i32 = required(&ini, "Timezone", "UtcOffset")?
            .parse()
            .map_err(|_| Error::Config("Timezone.UtcOffset must be a signed integer".into()))?;

        let voip_allow_list = ini
            .section(Some("VoIP"))
            .and_then(|s| s.get("AllowList"))
            .filter(|v| !v.is_empty())
            .map(|v| v.split(',').map(|e| e.trim().to_string()).collect())
            .unwrap_or_default();

        let hourly_call_limit = ini
            .section(Some("CallPreferences"))
            .and_then(|s| s.get("HourlyCallLimit"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let do_not_disturb = ini
            .section(Some("CallPreferences"))
            .and_then(|s| s.get("DoNotDisturb"))
            .filter(|v| !v.is_empty())
            .map(|v| serde_json::from_str::<Vec<HourWindow>>(v))
            .transpose()
            .map_err(|e| Error::Config(format!("CallPreferences.DoNotDisturb must be a JSON array of [start,end] pairs: {e}")))?
            .unwrap_or_default();

        let public_ip = if public_ip_field == "auto" {
            resolve_public_ip().await?
        } else {
            public_ip_field
                .parse()
                .map_err(|_| Error::Config(format!("Server.PublicIP is not a valid address: {public_ip_field}")))?
        };

        Ok(Config {
            public_ip,
            voip_address,
            voip_allow_list,
            discord_bot_token,
            discord_home_guild_id,
            discord_home_voice_channel_id,
            discord_home_text_channel_id,
            welcome_message,
            incoming_call_message,
            utc_offset_hours,
            hourly_call_limit,
            do_not_disturb,
        })
    }
}

/// One-shot lookup against an IP-echo endpoint, matching the original's
/// `checkip.amazonaws.com` call.
async fn resolve_public_ip() -> Result<IpAddr> {
    let body = reqwest::get(IP_DISCOVERY_ENDPOINT).await?.text().await?;
    body.trim()
        .parse()
        .map_err(|_| Error::Config(format!("IP discovery endpoint returned an unparsable address: {body:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_sample(extra: &str) -> tempfile_path::TempIni {
        tempfile_path::TempIni::new(&format!(
            "[Server]\n\
PublicIP=192.0.2.1\n\
[VoIP]\n\
Address=10.0.0.5\n\
AllowList=10.0.0.6,10.0.0.7\n\
[Discord]\n\
BotToken=tok\n\
HomeGuildID=1\n\
HomeVoiceChannelID=2\n\
HomeTextChannelID=3\n\
[Messages]\n\
Welcome=hi\n\
IncomingCall=ringing\n\
[Timezone]\n\
UtcOffset=-5\n\
{extra}"
        ))
    }

    /// Tiny local helper so this test doesn't need the `tempfile` crate
    /// just to write one scratch file.
    mod tempfile_path {
        use std::fs;
        use std::path::PathBuf;

        pub struct TempIni(pub PathBuf);

        impl TempIni {
            pub fn new(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!("hotline-bridge-test-{:x}.ini", rand::random::<u64>()));
                fs::write(&path, contents).unwrap();
                TempIni(path)
            }
        }

        impl Drop for TempIni {
            fn drop(&mut self) {
                let _ = fs::remove_file(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn loads_required_fields_and_defaults() {
        let tmp = write_sample("");
        let cfg = Config::load(&tmp.0).await.unwrap();
        assert_eq!(cfg.voip_address, "10.0.0.5");
        assert_eq!(cfg.voip_allow_list, vec!["10.0.0.6", "10.0.0.7"]);
        assert_eq!(cfg.utc_offset_hours, -5);
        assert_eq!(cfg.hourly_call_limit, 0);
        assert!(cfg.do_not_disturb.is_empty());
    }

    #[tokio::test]
    async fn parses_call_preferences_section() {
        let tmp = write_sample("[CallPreferences]\nHourlyCallLimit=3\nDoNotDisturb=[[22,24],[0,7]]\n");
        let cfg = Config::load(&tmp.0).await.unwrap();
        assert_eq!(cfg.hourly_call_limit, 3);
        assert_eq!(cfg.do_not_disturb, vec![(22, 24), (0, 7)]);
    }

    #[tokio::test]
    async fn missing_mandatory_field_is_an_error() {
        let tmp = tempfile_path::TempIni::new("[Server]\nPublicIP=192.0.2.1\n");
        let mut f = std::fs::OpenOptions::new().append(true).open(&tmp.0).unwrap();
        writeln!(f, "[VoIP]\nAddress=10.0.0.5").unwrap();
        assert!(Config::load(&tmp.0).await.is_err());
    }
}
