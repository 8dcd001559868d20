// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! PCIe FPGA DMA 字符设备 (ioctl + mmap)

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info};

use super::{CaptureDevice, DeviceInfo, PixelFormat};
use crate::error::{LprError, Result};
use crate::ring::SharedFrame;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FpgaInfoRaw {
    vendor_id: u32,
    device_id: u32,
    bar0_size: u32,
    bar1_size: u32,
    link_width: u32,
    link_speed: u32,
    frame_width: u32,
    frame_height: u32,
    frame_bpp: u32,
    frame_stride: u32,
    pixel_format: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DmaTransfer {
    size: u32,
    offset: u32,
    flags: u32,
    result: i32,
    user_buf: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct BufferMap {
    index: u32,
    size: u32,
    offset: u64,
}

// asm-generic _IOC layout: dir:2 | size:14 | type:8 | nr:8
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;
const IOC_MAGIC: u64 = b'F' as u64;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (IOC_MAGIC << 8) | nr
}

const FPGA_DMA_GET_INFO: u64 = ioc(IOC_READ, 1, std::mem::size_of::<FpgaInfoRaw>());
const FPGA_DMA_READ_FRAME: u64 = ioc(IOC_READ | IOC_WRITE, 2, std::mem::size_of::<DmaTransfer>());
const FPGA_DMA_MAP_BUFFER: u64 = ioc(IOC_READ | IOC_WRITE, 3, std::mem::size_of::<BufferMap>());

fn os_error(what: &str) -> LprError {
    LprError::hardware(format!("{what}: {}", io::Error::last_os_error()))
}

/// `mmap`ed DMA buffer, unmapped when the last reference goes away.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    map_len: usize,
    frame_len: usize,
}

// The mapping is PROT_READ and only ever read through shared slices.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn map(file: &File, map_len: usize, frame_len: usize) -> Result<Self> {
        // SAFETY: fresh read-only shared mapping of the device's DMA buffer
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| LprError::hardware("mmap returned null"))?;
        Ok(Self {
            ptr,
            map_len,
            frame_len: frame_len.min(map_len),
        })
    }

    pub fn len(&self) -> usize {
        self.frame_len
    }

    pub fn is_empty(&self) -> bool {
        self.frame_len == 0
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: ptr is valid for map_len >= frame_len bytes until drop
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.frame_len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `map` mapped
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.map_len);
        }
        debug!("DMA buffer unmapped ({} bytes)", self.map_len);
    }
}

/// Linux character device exposed by the PCIe DMA driver
pub struct FpgaDevice {
    // field order matters: unmap before the fd closes
    map: Arc<MappedRegion>,
    file: File,
    info: DeviceInfo,
}

impl FpgaDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| LprError::hardware(format!("open {}: {e}", path.display())))?;

        let mut raw = FpgaInfoRaw::default();
        // SAFETY: GET_INFO fills a struct fpga_info
        if unsafe { libc::ioctl(file.as_raw_fd(), FPGA_DMA_GET_INFO as _, &mut raw) } < 0 {
            return Err(os_error("FPGA_DMA_GET_INFO"));
        }
        let pixel_format = PixelFormat::from_raw(raw.pixel_format).ok_or_else(|| {
            LprError::hardware(format!("unknown pixel format code {}", raw.pixel_format))
        })?;
        let info = DeviceInfo {
            vendor_id: raw.vendor_id,
            device_id: raw.device_id,
            width: raw.frame_width,
            height: raw.frame_height,
            bpp: raw.frame_bpp,
            stride: raw.frame_stride,
            pixel_format,
        };
        info.validate()?;

        let mut bm = BufferMap::default();
        // SAFETY: MAP_BUFFER reads index and fills size/offset
        if unsafe { libc::ioctl(file.as_raw_fd(), FPGA_DMA_MAP_BUFFER as _, &mut bm) } < 0 {
            return Err(os_error("FPGA_DMA_MAP_BUFFER"));
        }
        let frame_len = info.default_transfer_size();
        if (bm.size as usize) < frame_len {
            return Err(LprError::hardware(format!(
                "DMA buffer {} bytes smaller than one frame ({frame_len})",
                bm.size
            )));
        }
        let map = Arc::new(MappedRegion::map(&file, bm.size as usize, frame_len)?);

        info!(
            "📟 {} vendor={:#06x} device={:#06x} link x{} gen{} {}x{} {:?} stride={} map={} bytes",
            path.display(),
            raw.vendor_id,
            raw.device_id,
            raw.link_width,
            raw.link_speed,
            info.width,
            info.height,
            info.pixel_format,
            info.stride(),
            bm.size
        );
        Ok(Self { map, file, info })
    }
}

impl CaptureDevice for FpgaDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read_frame(&mut self, size: usize, dst: Option<&mut [u8]>) -> Result<usize> {
        let want = if size == 0 {
            self.info.default_transfer_size()
        } else {
            size
        };
        if want > self.map.map_len {
            return Err(LprError::hardware(format!(
                "transfer of {want} bytes exceeds device buffer ({})",
                self.map.map_len
            )));
        }
        let user_buf = match dst {
            Some(buf) if buf.len() < want => {
                return Err(LprError::hardware(format!(
                    "destination holds {} bytes, transfer needs {want}",
                    buf.len()
                )))
            }
            Some(buf) => buf.as_mut_ptr() as u64,
            None => 0,
        };
        let mut t = DmaTransfer {
            size: size as u32,
            user_buf,
            ..Default::default()
        };
        // SAFETY: user_buf is null or points at >= want writable bytes
        if unsafe { libc::ioctl(self.file.as_raw_fd(), FPGA_DMA_READ_FRAME as _, &mut t) } < 0 {
            return Err(os_error("FPGA_DMA_READ_FRAME"));
        }
        if t.result != 0 {
            return Err(LprError::hardware(format!(
                "FPGA_DMA_READ_FRAME result {}",
                t.result
            )));
        }
        Ok(want)
    }

    fn mapped(&self) -> Option<SharedFrame> {
        Some(Arc::clone(&self.map) as SharedFrame)
    }
}
