//! DRM card access and output discovery

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use drm::control::{
    connector, crtc, plane, property, Device as ControlDevice, Mode, ModeTypeFlags, ResourceHandles,
};
use drm::{ClientCapability, Device, DriverCapability};
use tracing::{debug, info};

const DRM_PRIME_CAP_EXPORT: u64 = 0x2;
const DRM_PLANE_TYPE_PRIMARY: u64 = 1;

/// An open `/dev/dri/card*` node.
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    /// Open a card that can allocate dumb buffers and export them as dmabufs.
    pub fn open(path: &Path) -> Result<Self> {
        // std sets O_CLOEXEC on every open
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| eyre!("cannot open \"{}\": {}", path.display(), e))?;
        let card = Card(file);

        if card.get_driver_capability(DriverCapability::DumbBuffer)? == 0 {
            return Err(eyre!("{} can't give us dumb buffers", path.display()));
        }
        if card.get_driver_capability(DriverCapability::Prime)? & DRM_PRIME_CAP_EXPORT == 0 {
            return Err(eyre!("{} can't export dmabuf", path.display()));
        }

        Ok(card)
    }
}

/// Plane property handles written by every flip.
#[derive(Debug, Clone, Copy)]
pub struct PlaneProps {
    pub fb_id: property::Handle,
    pub crtc_id: property::Handle,
    pub src_x: property::Handle,
    pub src_y: property::Handle,
    pub src_w: property::Handle,
    pub src_h: property::Handle,
    pub crtc_x: property::Handle,
    pub crtc_y: property::Handle,
    pub crtc_w: property::Handle,
    pub crtc_h: property::Handle,
}

impl PlaneProps {
    fn lookup(card: &Card, plane: plane::Handle) -> Result<Self> {
        let props = card.get_properties(plane)?.as_hashmap(card)?;
        let get = |name: &str| {
            props
                .get(name)
                .map(|info| info.handle())
                .ok_or_else(|| eyre!("no plane property: {}", name))
        };

        Ok(Self {
            fb_id: get("FB_ID")?,
            crtc_id: get("CRTC_ID")?,
            src_x: get("SRC_X")?,
            src_y: get("SRC_Y")?,
            src_w: get("SRC_W")?,
            src_h: get("SRC_H")?,
            crtc_x: get("CRTC_X")?,
            crtc_y: get("CRTC_Y")?,
            crtc_w: get("CRTC_W")?,
            crtc_h: get("CRTC_H")?,
        })
    }
}

/// The single connector → CRTC → plane chain frames are presented on.
#[derive(Debug, Clone)]
pub struct Output {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    pub plane: plane::Handle,
    pub mode: Mode,
    pub props: PlaneProps,
}

impl Output {
    pub fn size(&self) -> (u32, u32) {
        let (w, h) = self.mode.size();
        (w as u32, h as u32)
    }

    /// Pick the first connected connector, its preferred mode, its CRTC and a plane for it.
    pub fn discover(card: &Card) -> Result<Self> {
        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|e| eyre!("DRM: no universal planes support: {}", e))?;
        card.set_client_capability(ClientCapability::Atomic, true)
            .map_err(|e| eyre!("DRM: no atomic modesetting support: {}", e))?;

        let res = card.resource_handles()?;

        let conn = res
            .connectors()
            .iter()
            .filter_map(|&h| card.get_connector(h, true).ok())
            .find(|info| info.state() == connector::State::Connected && !info.modes().is_empty())
            .ok_or_else(|| eyre!("available drm output not found"))?;

        for mode in conn.modes() {
            let (w, h) = mode.size();
            let preferred = mode.mode_type().contains(ModeTypeFlags::PREFERRED);
            debug!("mode: {}x{}@{} {}", w, h, mode.vrefresh(), if preferred { "*" } else { "" });
        }
        let mode = conn
            .modes()
            .iter()
            .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
            .unwrap_or(&conn.modes()[0])
            .to_owned();

        let encoder = conn
            .current_encoder()
            .or_else(|| conn.encoders().first().copied())
            .ok_or_else(|| eyre!("connector {:?} has no encoder", conn.handle()))?;
        let encoder = card.get_encoder(encoder)?;
        let crtc = encoder
            .crtc()
            .or_else(|| res.filter_crtcs(encoder.possible_crtcs()).first().copied())
            .ok_or_else(|| eyre!("encoder {:?} has no usable crtc", encoder.handle()))?;

        let plane = find_plane(card, &res, crtc)?;
        let props = PlaneProps::lookup(card, plane)?;

        let (w, h) = mode.size();
        info!("DRM: connector {:?}", conn.handle());
        info!("DRM: plane {:?} crtc {:?}", plane, crtc);
        info!("DRM: width:{} height:{}", w, h);

        Ok(Self {
            connector: conn.handle(),
            crtc,
            plane,
            mode,
            props,
        })
    }
}

/// A primary plane for `crtc` if there is one, otherwise any plane that can drive it.
fn find_plane(card: &Card, res: &ResourceHandles, crtc: crtc::Handle) -> Result<plane::Handle> {
    let mut fallback = None;

    for handle in card.plane_handles()? {
        let info = match card.get_plane(handle) {
            Ok(info) => info,
            Err(e) => {
                debug!("get_plane({:?}) failed: {}", handle, e);
                continue;
            }
        };
        if !res.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
            continue;
        }
        if is_primary(card, handle)? {
            return Ok(handle);
        }
        fallback.get_or_insert(handle);
    }

    fallback.ok_or_else(|| eyre!("DRM: could not find a suitable plane for crtc {:?}", crtc))
}

fn is_primary(card: &Card, plane: plane::Handle) -> Result<bool> {
    let props = card.get_properties(plane)?;
    let (ids, values) = props.as_props_and_values();
    for (&id, &value) in ids.iter().zip(values) {
        let info = card.get_property(id)?;
        if info.name().to_bytes() == b"type" {
            return Ok(value == DRM_PLANE_TYPE_PRIMARY);
        }
    }
    Ok(false)
}
