//! Kernel buffer pool: the mmap arena and the slot hand-off protocol.
//!
//! Each slot is one kernel-allocated capture buffer mapped into process
//! memory. Ownership alternates between the driver (queued, hardware may
//! write) and the engine (dequeued, safe to read); the per-slot tag makes
//! a read or requeue of a driver-owned slot a hard error instead of a
//! data race.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::slice;

use log::warn;
use v4l::v4l2;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_memory_V4L2_MEMORY_MMAP,
    v4l2_requestbuffers,
};

use crate::sys;
use crate::traits::{CameraError, Result, BUFFER_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOwner {
    /// Queued with the driver; the hardware may be writing it.
    Driver,
    /// Dequeued; the engine may read it until it is queued again.
    Engine,
}

struct Slot {
    /// Base of the mapping; null once unmapped.
    ptr: *mut u8,
    length: usize,
    owner: SlotOwner,
}

/// A slot the driver just handed over, ready to be copied out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadySlot {
    pub index: u32,
    pub bytes_used: usize,
}

/// The pool of kernel-mapped capture buffers for one streaming session.
///
/// Holds raw mappings, so it is deliberately neither `Send` nor `Sync`;
/// one thread of control drives the whole dequeue/requeue cycle.
pub(crate) struct BufferPool {
    fd: c_int,
    slots: Vec<Slot>,
}

impl BufferPool {
    /// Request, map and queue the full pool.
    ///
    /// On any failure everything mapped so far is unmapped again, so a
    /// retry re-issues the allocation request against a clean state.
    pub(crate) fn allocate(fd: c_int) -> Result<Self> {
        let mut request = v4l2_requestbuffers {
            count: BUFFER_COUNT,
            type_: v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2_memory_V4L2_MEMORY_MMAP,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut request as *mut v4l2_requestbuffers as *mut c_void,
            )
        }
        .map_err(CameraError::BufferRequestFailed)?;
        if request.count != BUFFER_COUNT {
            return Err(CameraError::BufferShortfall {
                requested: BUFFER_COUNT,
                granted: request.count,
            });
        }

        let mut pool = Self {
            fd,
            slots: Vec::with_capacity(BUFFER_COUNT as usize),
        };
        for index in 0..BUFFER_COUNT {
            match pool.map_slot(index) {
                Ok(slot) => pool.slots.push(slot),
                Err(err) => {
                    pool.release();
                    return Err(err);
                }
            }
        }
        for index in 0..BUFFER_COUNT {
            if let Err(err) = pool.queue(index) {
                pool.release();
                return Err(err);
            }
        }
        Ok(pool)
    }

    /// Query one buffer's true length and offset, then map it.
    fn map_slot(&self, index: u32) -> Result<Slot> {
        let mut buf = v4l2_buffer {
            index,
            type_: v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2_memory_V4L2_MEMORY_MMAP,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            sys::xioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QUERYBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        }
        .map_err(CameraError::BufferRequestFailed)?;

        let length = buf.length as usize;
        let offset = unsafe { buf.m.offset };
        #[allow(clippy::cast_possible_wrap)]
        let mapping = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        }
        .map_err(|source| CameraError::BufferMapFailed { index, source })?;

        Ok(Slot {
            ptr: mapping.cast(),
            length,
            owner: SlotOwner::Engine,
        })
    }

    /// Hand a slot to the driver. Used both for the initial queueing at
    /// stream start and for every requeue after a copy.
    pub(crate) fn queue(&mut self, index: u32) -> Result<()> {
        let count = self.slots.len() as u32;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(CameraError::SlotOutOfRange { index, count })?;
        if slot.owner != SlotOwner::Engine {
            return Err(CameraError::SlotNotHeld(index));
        }

        let mut buf = v4l2_buffer {
            index,
            type_: v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2_memory_V4L2_MEMORY_MMAP,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            sys::xioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        }
        .map_err(|source| CameraError::QueueFailed { index, source })?;
        slot.owner = SlotOwner::Driver;
        Ok(())
    }

    /// Ask the driver which slot is ready, transferring its ownership to
    /// the engine. `Ok(None)` is the tolerated transient I/O error: no
    /// frame this call, nothing changed hands.
    pub(crate) fn dequeue(&mut self) -> Result<Option<ReadySlot>> {
        let mut buf = v4l2_buffer {
            type_: v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2_memory_V4L2_MEMORY_MMAP,
            ..unsafe { mem::zeroed() }
        };
        match unsafe {
            sys::xioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_DQBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        } {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EIO) => {
                warn!("transient I/O error on dequeue, no frame this call");
                return Ok(None);
            }
            Err(err) => return Err(CameraError::DequeueFailed(err)),
        }

        let index = buf.index;
        let count = self.slots.len() as u32;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(CameraError::SlotOutOfRange { index, count })?;
        if slot.owner == SlotOwner::Engine {
            return Err(CameraError::SlotAlreadyHeld(index));
        }
        slot.owner = SlotOwner::Engine;
        Ok(Some(ReadySlot {
            index,
            bytes_used: buf.bytesused as usize,
        }))
    }

    /// Payload bytes of a held slot, clamped to the mapped length.
    pub(crate) fn slot_data(&self, index: u32, len: usize) -> Result<&[u8]> {
        let count = self.slots.len() as u32;
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(CameraError::SlotOutOfRange { index, count })?;
        if slot.owner != SlotOwner::Engine {
            return Err(CameraError::SlotNotHeld(index));
        }
        Ok(unsafe { slice::from_raw_parts(slot.ptr, len.min(slot.length)) })
    }

    /// Start the capture stream.
    pub(crate) fn stream_on(&self) -> Result<()> {
        let mut kind = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            sys::xioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_STREAMON,
                &mut kind as *mut _ as *mut c_void,
            )
        }
        .map_err(CameraError::StreamOnFailed)
    }

    /// Stop the capture stream. Mappings stay valid until [`release`].
    ///
    /// [`release`]: Self::release
    pub(crate) fn stream_off(&self) -> Result<()> {
        let mut kind = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            sys::xioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_STREAMOFF,
                &mut kind as *mut _ as *mut c_void,
            )
        }
        .map_err(CameraError::StreamOffFailed)
    }

    /// Unmap every still-mapped slot, zeroing its table entry so a later
    /// defensive pass is a no-op. Best-effort: an munmap failure is
    /// logged and the entry is cleared regardless.
    pub(crate) fn release(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.ptr.is_null() {
                continue;
            }
            if let Err(err) = unsafe { v4l2::munmap(slot.ptr.cast(), slot.length) } {
                warn!("failed to unmap buffer {index}: {err}");
            }
            slot.ptr = ptr::null_mut();
            slot.length = 0;
            slot.owner = SlotOwner::Driver;
        }
    }

    /// Number of slots currently mapped.
    pub(crate) fn mapped_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.ptr.is_null()).count()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.release();
    }
}
