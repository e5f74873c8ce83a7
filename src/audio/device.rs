//! Audio device naming and V4L2 to ALSA matching

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

/// Split `"<video>,<audio>"` into its parts. The audio part is `None` when
/// absent or empty.
pub fn split_device(device: &str) -> (String, Option<String>) {
    match device.split_once(',') {
        Some((video, audio)) => {
            let audio = audio.trim();
            (
                video.trim().to_string(),
                (!audio.is_empty()).then(|| audio.to_string()),
            )
        }
        None => (device.trim().to_string(), None),
    }
}

/// Hardware identity from a sysfs `uevent` file (`PRODUCT` for USB,
/// `PCI_SUBSYS_ID` for PCI)
pub fn device_id_from_uevent(uevent: &str) -> Option<String> {
    uevent.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        matches!(key, "PRODUCT" | "PCI_SUBSYS_ID").then(|| value.trim().to_string())
    })
}

fn read_device_id(path: &Path) -> Option<String> {
    let uevent = std::fs::read_to_string(path).ok()?;
    device_id_from_uevent(&uevent)
}

/// Last path component of a device path (`/dev/video0` -> `video0`)
fn device_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Find the ALSA capture device that sits on the same hardware as a V4L2
/// device. `card_pcm` returns the PCM name for a card index. Falls back to
/// the video device string when nothing matches.
pub fn find_alsa_device_in<F>(sys_root: &Path, video_device: &str, card_pcm: F) -> String
where
    F: Fn(i32) -> Option<String>,
{
    let video_ids: HashMap<String, String> = std::fs::read_dir(sys_root.join("class/video4linux"))
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("video") {
                return None;
            }
            let id = read_device_id(&entry.path().join("device/uevent"))?;
            Some((name, id))
        })
        .collect();

    let Some(video_id) = video_ids.get(device_name(video_device)) else {
        debug!("No sysfs identity for {}", video_device);
        return video_device.to_string();
    };

    let mut cards: Vec<i32> = std::fs::read_dir(sys_root.join("class/sound"))
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix("card")?
                .parse()
                .ok()
        })
        .collect();
    cards.sort_unstable();

    for card in cards {
        let uevent = sys_root.join(format!("class/sound/card{}/device/uevent", card));
        if read_device_id(&uevent).as_ref() != Some(video_id) {
            continue;
        }
        if let Some(pcm) = card_pcm(card) {
            info!("{} => {}", video_device, pcm);
            return pcm;
        }
    }

    video_device.to_string()
}

/// First capture PCM name ALSA advertises for a card
pub fn card_pcm_name(card_index: i32) -> Option<String> {
    let card = alsa::Card::new(card_index);
    let hints = alsa::device_name::HintIter::new_str(Some(&card), "pcm").ok()?;
    hints
        .filter(|hint| hint.direction != Some(alsa::Direction::Playback))
        .find_map(|hint| hint.name)
}

/// Find the ALSA device matching a V4L2 device through `/sys`
pub fn find_alsa_device(video_device: &str) -> String {
    find_alsa_device_in(Path::new("/sys"), video_device, card_pcm_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn split_video_and_audio() {
        assert_eq!(
            split_device("/dev/video0,hw:1,0"),
            ("/dev/video0".to_string(), Some("hw:1,0".to_string()))
        );
        assert_eq!(split_device("/dev/video2"), ("/dev/video2".to_string(), None));
        assert_eq!(split_device("/dev/video2,"), ("/dev/video2".to_string(), None));
    }

    #[test]
    fn uevent_identity() {
        let usb = "DEVTYPE=usb_interface\nDRIVER=uvcvideo\nPRODUCT=534d/2109/2100\nTYPE=239/2/1\n";
        assert_eq!(device_id_from_uevent(usb).as_deref(), Some("534d/2109/2100"));
        let pci = "DRIVER=cx23885\nPCI_SUBSYS_ID=0070:C138\n";
        assert_eq!(device_id_from_uevent(pci).as_deref(), Some("0070:C138"));
        assert_eq!(device_id_from_uevent("DRIVER=x\n"), None);
    }

    fn write_uevent(root: &Path, rel: &str, body: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("uevent"), body).unwrap();
    }

    #[test]
    fn matches_sound_card_by_product() {
        let sys = tempfile::tempdir().unwrap();
        write_uevent(sys.path(), "class/video4linux/video0/device", "PRODUCT=534d/2109/2100\n");
        write_uevent(sys.path(), "class/sound/card0/device", "PRODUCT=8086/1234/1\n");
        write_uevent(sys.path(), "class/sound/card1/device", "PRODUCT=534d/2109/2100\n");

        let found = find_alsa_device_in(sys.path(), "/dev/video0", |card| {
            Some(format!("plughw:CARD={},DEV=0", card))
        });
        assert_eq!(found, "plughw:CARD=1,DEV=0");
    }

    #[test]
    fn falls_back_to_video_device() {
        let sys = tempfile::tempdir().unwrap();
        write_uevent(sys.path(), "class/video4linux/video0/device", "PRODUCT=1/2/3\n");
        write_uevent(sys.path(), "class/sound/card0/device", "PRODUCT=4/5/6\n");

        let found = find_alsa_device_in(sys.path(), "/dev/video0", |_| Some("hw:0".into()));
        assert_eq!(found, "/dev/video0");
        let missing = find_alsa_device_in(sys.path(), "/dev/video9", |_| Some("hw:0".into()));
        assert_eq!(missing, "/dev/video9");
    }
}
