// Per-thread I/O-port permission bitmap.
//
// One bit per port, set = denied (the hardware convention). Threads start
// with every port denied; drivers granted ports get their bits cleared.

/// 8 KiB covers the full 16-bit port space.
pub const IOPB_BYTES: usize = 8192;

pub struct IoPortBitmap {
    bits: [u8; IOPB_BYTES],
    /// Anything other than the default all-denied map.
    custom: bool,
}

impl IoPortBitmap {
    pub const fn deny_all() -> Self {
        Self {
            bits: [0xFF; IOPB_BYTES],
            custom: false,
        }
    }

    pub fn is_custom(&self) -> bool {
        self.custom
    }

    pub fn allow(&mut self, port: u16) {
        self.bits[(port / 8) as usize] &= !(1 << (port % 8));
        self.custom = true;
    }

    pub fn deny(&mut self, port: u16) {
        self.bits[(port / 8) as usize] |= 1 << (port % 8);
        self.custom = self.bits != [0xFF; IOPB_BYTES];
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.bits[(port / 8) as usize] & (1 << (port % 8)) == 0
    }

    pub fn bytes(&self) -> &[u8; IOPB_BYTES] {
        &self.bits
    }

    pub fn copy_from(&mut self, other: &IoPortBitmap) {
        self.bits = other.bits;
        self.custom = other.custom;
    }
}

impl Clone for IoPortBitmap {
    fn clone(&self) -> Self {
        Self {
            bits: self.bits,
            custom: self.custom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_denies_everything() {
        let map = IoPortBitmap::deny_all();
        assert!(!map.is_custom());
        assert!(!map.is_allowed(0));
        assert!(!map.is_allowed(0x3F8));
        assert!(!map.is_allowed(u16::MAX));
    }

    #[test]
    fn allow_and_revoke_single_port() {
        let mut map = IoPortBitmap::deny_all();
        map.allow(0x3F8);
        assert!(map.is_custom());
        assert!(map.is_allowed(0x3F8));
        assert!(!map.is_allowed(0x3F9));

        map.deny(0x3F8);
        assert!(!map.is_allowed(0x3F8));
        assert!(!map.is_custom());
    }
}
