//! Arbitrary memory peek/poke.
//!
//! Two completely different implementations live behind the same small
//! API, selected at compile time: the Mach variant validates the range
//! with the kernel before touching it and reports a typed error reply on
//! failure; the generic variant just dereferences the address and trusts
//! the controller completely, exactly as the protocol's error-handling
//! policy describes (a bad address there is a fatal host error, accepted
//! by design).

#[cfg(target_os = "macos")]
pub use mach::{peek, poke};

#[cfg(not(target_os = "macos"))]
pub use generic::{peek, poke};

#[cfg(target_os = "macos")]
mod mach {
    //! `mach_vm_read` is used purely to validate that the range is mapped
    //! and readable before we touch it. The source this protocol was
    //! distilled from pays that validation cost but then sends bytes from
    //! a raw pointer cast to the original address rather than from the
    //! validated buffer `mach_vm_read` handed back, almost certainly a
    //! bug in the original rather than a deliberate choice (see the design
    //! note on this). We take the safer reading: the bytes we send are the
    //! ones the kernel actually validated and copied out, not a second,
    //! unchecked dereference of the same address.

    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_deallocate, mach_vm_read, mach_vm_write};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    /// Returns `Some(bytes)` on success, `None` if the range is not
    /// mapped/readable (the caller sends `REPLY_ERROR` in that case).
    pub fn peek(address: u64, size: u64) -> anyhow::Result<Option<Vec<u8>>> {
        let task = unsafe { mach_task_self() };
        let mut data_ptr: mach2::vm_types::vm_offset_t = 0;
        let mut data_cnt: mach2::message::mach_msg_type_number_t = 0;

        let kr = unsafe {
            mach_vm_read(
                task,
                address as mach_vm_address_t,
                size as mach_vm_size_t,
                &mut data_ptr,
                &mut data_cnt,
            )
        };
        if kr != KERN_SUCCESS {
            return Ok(None);
        }

        let bytes = unsafe {
            std::slice::from_raw_parts(data_ptr as *const u8, data_cnt as usize).to_vec()
        };
        unsafe {
            mach_vm_deallocate(task, data_ptr as mach_vm_address_t, data_cnt as mach_vm_size_t);
        }
        Ok(Some(bytes))
    }

    /// Returns `true` on success, `false` on failure (caller sends
    /// `REPLY_ERROR` in that case).
    pub fn poke(address: u64, data: &[u8]) -> anyhow::Result<bool> {
        let task = unsafe { mach_task_self() };
        let kr = unsafe {
            mach_vm_write(
                task,
                address as mach_vm_address_t,
                data.as_ptr() as mach2::vm_types::vm_offset_t,
                data.len() as mach2::message::mach_msg_type_number_t,
            )
        };
        Ok(kr == KERN_SUCCESS)
    }
}

#[cfg(not(target_os = "macos"))]
mod generic {
    //! No validation at all: a bad address here faults the whole process.
    //! That is the documented behavior, not an oversight.

    /// Always returns `Some`; a bad address crashes the process instead of
    /// producing an error reply (the generic variant has no error reply).
    pub fn peek(address: u64, size: u64) -> anyhow::Result<Option<Vec<u8>>> {
        let bytes = unsafe {
            std::slice::from_raw_parts(address as *const u8, size as usize).to_vec()
        };
        Ok(Some(bytes))
    }

    /// Always returns `true`; a bad address crashes the process instead of
    /// producing an error reply.
    pub fn poke(address: u64, data: &[u8]) -> anyhow::Result<bool> {
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }
        Ok(true)
    }
}

#[cfg(all(test, not(target_os = "macos")))]
mod tests {
    use super::*;

    #[test]
    fn generic_peek_poke_round_trips_on_owned_buffer() {
        let mut buf = [0u8; 16];
        let addr = buf.as_mut_ptr() as u64;

        let payload = b"0123456789abcdef";
        poke(addr, payload).unwrap();

        let read_back = peek(addr, payload.len() as u64).unwrap().unwrap();
        assert_eq!(read_back, payload);
    }
}
