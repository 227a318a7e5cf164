//! Bus configuration, as loaded from JSON by embedders

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::bus::BusContext;
use super::{slot_id, DEFAULT_IMAGESIZE, MAX_IDS, MAX_LUNS};

/// One disk image to attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub target: u8,
    #[serde(default)]
    pub lun: u8,
    pub path: PathBuf,
    #[serde(default)]
    pub write_protect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiConfig {
    #[serde(default)]
    pub msg_after_status: bool,
    /// Capacity override in sectors, 0 to use the image size
    #[serde(default = "default_imagesize")]
    pub max_imagesize: u32,
    /// Cap on the capacity reported by READ CAPACITY in sectors, 0 for no cap
    #[serde(default = "default_imagesize")]
    pub limit_imagesize: u32,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
}

fn default_imagesize() -> u32 {
    DEFAULT_IMAGESIZE
}

impl Default for ScsiConfig {
    fn default() -> Self {
        Self {
            msg_after_status: false,
            max_imagesize: DEFAULT_IMAGESIZE,
            limit_imagesize: DEFAULT_IMAGESIZE,
            images: vec![],
        }
    }
}

impl ScsiConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Cannot parse {}", path.display()))
    }
}

impl BusContext {
    /// Resets the bus and applies `config`, attaching all images in order.
    /// Stops at the first image that fails to attach.
    pub fn apply_config(&mut self, config: &ScsiConfig) -> Result<()> {
        self.reset();
        self.set_msg_after_status(config.msg_after_status);
        self.set_max_imagesize(config.max_imagesize);
        self.set_limit_imagesize(config.limit_imagesize);

        for image in &config.images {
            if image.target as usize >= MAX_IDS || image.lun as usize >= MAX_LUNS {
                bail!(
                    "Invalid SCSI address {}:{} for {}",
                    image.target,
                    image.lun,
                    image.path.display()
                );
            }
            let slot = slot_id(image.target, image.lun);
            let store = self.store_mut();
            let attached = if image.write_protect {
                store.attach_readonly(slot, &image.path)
            } else {
                store.attach(slot, &image.path)
            };
            attached.with_context(|| {
                format!(
                    "Cannot attach image to SCSI ID {} LUN {}",
                    image.target, image.lun
                )
            })?;
            log::info!(
                "SCSI ID {} LUN {}: {}{}",
                image.target,
                image.lun,
                image.path.display(),
                if image.write_protect { " (read-only)" } else { "" }
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::image::tests::TempImage;
    use crate::scsi::image::MemoryImageStore;

    #[test]
    fn defaults() {
        let c = ScsiConfig::from_json("{}").unwrap();
        assert_eq!(c, ScsiConfig::default());
        assert_eq!(c.max_imagesize, 1048576);
    }

    #[test]
    fn parse() {
        let c = ScsiConfig::from_json(
            r#"{
                "msg_after_status": true,
                "max_imagesize": 0,
                "images": [
                    { "target": 0, "path": "/tmp/hd0.img" },
                    { "target": 2, "lun": 1, "path": "/tmp/cd.img", "write_protect": true }
                ]
            }"#,
        )
        .unwrap();
        assert!(c.msg_after_status);
        assert_eq!(c.max_imagesize, 0);
        assert_eq!(c.limit_imagesize, 1048576);
        assert_eq!(c.images.len(), 2);
        assert_eq!(c.images[0].lun, 0);
        assert!(!c.images[0].write_protect);
        assert_eq!(c.images[1].lun, 1);
        assert!(c.images[1].write_protect);
    }

    #[test]
    fn parse_error() {
        assert!(ScsiConfig::from_json(r#"{ "images": [ { "lun": 1 } ] }"#).is_err());
        assert!(ScsiConfig::load(Path::new("/nonexistent/scsi.json")).is_err());
    }

    #[test]
    fn apply() {
        let hd = TempImage::new(&[0x5A; 2048]);
        let cd = TempImage::new(&[0; 1024]);
        let config = ScsiConfig {
            msg_after_status: true,
            max_imagesize: 0,
            limit_imagesize: 1000,
            images: vec![
                ImageConfig {
                    target: 0,
                    lun: 0,
                    path: hd.path.clone(),
                    write_protect: false,
                },
                ImageConfig {
                    target: 3,
                    lun: 2,
                    path: cd.path.clone(),
                    write_protect: true,
                },
            ],
        };

        let mut ctx = BusContext::new(Box::new(MemoryImageStore::new()));
        ctx.apply_config(&config).unwrap();
        assert!(ctx.msg_after_status);
        assert_eq!(ctx.limit_imagesize, 1000);
        assert!(ctx.store().is_present(0, 0));
        assert!(!ctx.store().is_write_protected(0, 0));
        assert!(ctx.store().is_present(3, 2));
        assert!(ctx.store().is_write_protected(3, 2));
        assert_eq!(ctx.store().capacity_sectors(0, 0, 0), 4);
    }

    #[test]
    fn apply_bad_address() {
        let config = ScsiConfig {
            images: vec![ImageConfig {
                target: 7,
                lun: 0,
                path: PathBuf::from("/tmp/x.img"),
                write_protect: false,
            }],
            ..Default::default()
        };
        let mut ctx = BusContext::new(Box::new(MemoryImageStore::new()));
        assert!(ctx.apply_config(&config).is_err());
    }

    #[test]
    fn apply_missing_image() {
        let config = ScsiConfig {
            images: vec![ImageConfig {
                target: 1,
                lun: 0,
                path: PathBuf::from("/nonexistent/x.img"),
                write_protect: false,
            }],
            ..Default::default()
        };
        let mut ctx = BusContext::new(Box::new(MemoryImageStore::new()));
        assert!(ctx.apply_config(&config).is_err());
        assert!(!ctx.store().is_present(1, 0));
    }
}
