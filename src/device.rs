use std::{ffi::CStr, net::Ipv4Addr, ptr};

use bitflags::bitflags;
use log::debug;

use crate::Error;

bitflags! {
    /// Network interface flags.
    pub struct IfFlags: u32 {
        /// Set if the interface is up
        const UP = libc::IFF_UP as u32;
        /// Set if the interface is a loopback interface
        const LOOPBACK = libc::IFF_LOOPBACK as u32;
        /// Set if the interface is running
        const RUNNING = libc::IFF_RUNNING as u32;
        /// Set if the interface receives all packets on its link
        const PROMISC = libc::IFF_PROMISC as u32;
    }
}

impl From<u32> for IfFlags {
    fn from(flags: u32) -> Self {
        IfFlags::from_bits_truncate(flags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A host network interface and its IPv4 addresses.
pub struct Device {
    /// The name of the interface
    pub name: String,
    /// IPv4 addresses assigned to this interface
    pub addresses: Vec<Ipv4Addr>,
    /// Interface flags
    pub flags: IfFlags,
}

impl Device {
    pub fn new(name: String, addresses: Vec<Ipv4Addr>, flags: IfFlags) -> Device {
        Device {
            name,
            addresses,
            flags,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.flags.contains(IfFlags::LOOPBACK)
    }

    pub fn is_up(&self) -> bool {
        self.flags.contains(IfFlags::UP)
    }

    /// Returns every interface of the host that has at least one IPv4 address, in the order
    /// `getifaddrs` reports them.
    pub fn list() -> Result<Vec<Device>, Error> {
        unsafe {
            Device::with_all_ifaddrs(|mut ifa| {
                let mut devices: Vec<Device> = vec![];
                while !ifa.is_null() {
                    if let Some(addr) = convert_sockaddr((*ifa).ifa_addr) {
                        let name = CStr::from_ptr((*ifa).ifa_name)
                            .to_string_lossy()
                            .into_owned();
                        match devices.iter_mut().find(|d| d.name == name) {
                            Some(dev) => dev.addresses.push(addr),
                            None => devices.push(Device::new(
                                name,
                                vec![addr],
                                IfFlags::from((*ifa).ifa_flags as u32),
                            )),
                        }
                    }
                    ifa = (*ifa).ifa_next;
                }
                Ok(devices)
            })
        }
    }

    /// Picks the local address a capture socket should bind to.
    ///
    /// Falls back to `0.0.0.0` when no usable address exists or the interfaces cannot be listed.
    pub fn lookup_bind_address() -> Ipv4Addr {
        match Device::list() {
            Ok(devices) => select_bind_address(&devices),
            Err(e) => {
                debug!("interface lookup failed, binding to wildcard: {}", e);
                Ipv4Addr::UNSPECIFIED
            }
        }
    }

    unsafe fn with_all_ifaddrs<T, F>(func: F) -> Result<T, Error>
    where
        F: FnOnce(*mut libc::ifaddrs) -> Result<T, Error>,
    {
        let mut all: *mut libc::ifaddrs = ptr::null_mut();
        if libc::getifaddrs(&mut all) != 0 {
            return Err(Error::ErrnoError(errno::errno()));
        }
        let result = func(all);
        libc::freeifaddrs(all);
        result
    }
}

/// Returns the first non-loopback, non-wildcard IPv4 address of an interface that is up, or
/// `0.0.0.0` when there is none.
pub fn select_bind_address(devices: &[Device]) -> Ipv4Addr {
    devices
        .iter()
        .filter(|dev| dev.is_up() && !dev.is_loopback())
        .flat_map(|dev| dev.addresses.iter())
        .find(|addr| !addr.is_loopback() && !addr.is_unspecified())
        .copied()
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

unsafe fn convert_sockaddr(ptr: *const libc::sockaddr) -> Option<Ipv4Addr> {
    if ptr.is_null() {
        return None;
    }

    match (*ptr).sa_family as i32 {
        libc::AF_INET => {
            let ptr = ptr as *const libc::sockaddr_in;
            Some(u32::from_be((*ptr).sin_addr.s_addr).into())
        }
        _ => None,
    }
}
