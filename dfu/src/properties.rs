use crate::descriptor::{
    ConfigurationDescriptor, DFU_VERSION_NUMBER, DFUSE_VERSION_NUMBER,
    FunctionalDescriptor,
};

/// Capabilities negotiated from the DFU functional descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Properties {
    pub will_detach: bool,
    pub manifestation_tolerant: bool,
    pub can_upload: bool,
    pub can_download: bool,
    /// `wTransferSize`, never 0.
    pub transfer_size: u16,
    /// `wDetachTimeOut` in milliseconds.
    pub detach_timeout: u16,
    /// `bcdDFUVersion`
    pub dfu_version: u16,
}

impl Default for Properties {
    /// Bare DFU 1.0 device, used when no functional descriptor is found.
    fn default() -> Self {
        Properties {
            will_detach: false,
            manifestation_tolerant: true,
            can_upload: true,
            can_download: true,
            transfer_size: crate::DEFAULT_TRANSFER_SIZE,
            detach_timeout: 0,
            dfu_version: DFU_VERSION_NUMBER,
        }
    }
}

impl From<&FunctionalDescriptor> for Properties {
    fn from(desc: &FunctionalDescriptor) -> Self {
        Properties {
            will_detach: desc.will_detach(),
            manifestation_tolerant: desc.manifestation_tolerant(),
            can_upload: desc.can_upload(),
            can_download: desc.can_download(),
            transfer_size: desc.transfer_size().max(1),
            detach_timeout: desc.detach_timeout(),
            dfu_version: desc.dfu_version(),
        }
    }
}

impl Properties {
    /// Properties of an alternate setting of `config`.
    pub fn from_configuration(
        config: &ConfigurationDescriptor,
        interface: u8,
        alt_setting: u8,
    ) -> Self {
        match config.functional_descriptor(interface, alt_setting) {
            Some(desc) => Properties::from(desc),
            None => {
                log::debug!(
                    "no DFU functional descriptor in configuration {}, \
                     assuming DFU 1.0",
                    config.configuration_value
                );
                Properties::default()
            }
        }
    }

    pub fn is_dfuse_version(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_configuration_descriptor;
    use crate::descriptor::tests::dfuse_configuration;

    #[test]
    fn test_properties_from_configuration() {
        let config =
            parse_configuration_descriptor(&dfuse_configuration()).unwrap();
        let props = Properties::from_configuration(&config, 0, 1);
        assert!(props.will_detach);
        assert!(!props.manifestation_tolerant);
        assert!(props.can_upload);
        assert!(props.can_download);
        assert_eq!(props.transfer_size, 2048);
        assert_eq!(props.detach_timeout, 255);
        assert!(props.is_dfuse_version());
    }

    #[test]
    fn test_properties_defaults() {
        let data = [
            0x09, 0x02, 0x12, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, 0x09, 0x04,
            0x00, 0x00, 0x00, 0xFE, 0x01, 0x02, 0x00,
        ];
        let config = parse_configuration_descriptor(&data).unwrap();
        let props = Properties::from_configuration(&config, 0, 0);
        assert_eq!(props, Properties::default());
        assert_eq!(props.dfu_version, 0x0100);
        assert!(props.transfer_size > 0);
    }

    #[test]
    fn test_transfer_size_never_zero() {
        let desc = crate::descriptor::parse_functional_descriptor(&[
            0x09, 0x21, 0x03, 0x00, 0x00, 0x00, 0x00, 0x10, 0x01,
        ])
        .unwrap();
        assert_eq!(Properties::from(&desc).transfer_size, 1);
    }
}
