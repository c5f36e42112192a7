use log::debug;

use crate::descriptor::*;
use crate::error::DfuError;
use crate::memory::{MemoryMap, parse_memory_descriptor};
use crate::transport::{ControlSetup, Transport};

const GET_DESCRIPTOR: u8 = 0x06;
const MAX_STRING_DESC_LEN: u16 = 255;

/// One selectable DFU alternate setting.
#[derive(Clone, Debug)]
pub struct InterfaceSetting {
    name: Option<String>,
    configuration: u8,
    configuration_index: u8,
    interface: u8,
    alternate: u8,
    protocol: u8,
    string_index: u8,
    memory: Option<MemoryMap>,
}

impl InterfaceSetting {
    /// Interface string, usually a DfuSe memory layout.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    /// `bConfigurationValue`
    pub fn configuration(&self) -> u8 {
        self.configuration
    }
    pub(crate) fn configuration_index(&self) -> u8 {
        self.configuration_index
    }
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alternate(&self) -> u8 {
        self.alternate
    }
    /// 1 for a runtime interface, 2 for DFU mode.
    pub fn protocol(&self) -> u8 {
        self.protocol
    }
    /// Memory map parsed from the interface name.
    pub fn memory(&self) -> Option<&MemoryMap> {
        self.memory.as_ref()
    }

    fn set_name(&mut self, name: String) {
        self.memory = parse_memory_descriptor(&name).ok();
        self.name = Some(name);
    }
}

pub fn read_device_descriptor<T: Transport>(
    transport: &mut T,
) -> Result<DeviceDescriptor, DfuError> {
    let data =
        get_descriptor(transport, DT_DEVICE, 0, 0, DEVICE_DESC_LEN as u16)?;
    parse_device_descriptor(&data)
}

/// Read configuration `index`: the header first to learn `wTotalLength`,
/// then the whole descriptor set.
pub fn read_configuration_descriptor<T: Transport>(
    transport: &mut T,
    index: u8,
) -> Result<ConfigurationDescriptor, DfuError> {
    let header = get_descriptor(
        transport,
        DT_CONFIGURATION,
        index,
        0,
        CONFIGURATION_DESC_LEN as u16,
    )?;
    if header.len() < CONFIGURATION_DESC_LEN {
        return Err(malformed_header(header.len()));
    }
    let total_length = u16::from_le_bytes([header[2], header[3]]);
    let data =
        get_descriptor(transport, DT_CONFIGURATION, index, 0, total_length)?;
    parse_configuration_descriptor(&data)
}

fn malformed_header(len: usize) -> DfuError {
    DfuError::MalformedDescriptor(format!(
        "configuration header is {len} bytes, expected {CONFIGURATION_DESC_LEN}"
    ))
}

/// Language ids supported by the device (string descriptor 0).
pub fn read_languages<T: Transport>(
    transport: &mut T,
) -> Result<Vec<u16>, DfuError> {
    let data = get_descriptor(transport, DT_STRING, 0, 0, MAX_STRING_DESC_LEN)?;
    Ok(string_payload(&data)?
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Read and decode a UTF-16LE string descriptor.
pub fn read_string_descriptor<T: Transport>(
    transport: &mut T,
    index: u8,
    language: u16,
) -> Result<String, DfuError> {
    let data = get_descriptor(
        transport,
        DT_STRING,
        index,
        language,
        MAX_STRING_DESC_LEN,
    )?;
    let units: Vec<u16> = string_payload(&data)?
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

fn string_payload(data: &[u8]) -> Result<&[u8], DfuError> {
    match data {
        [len, DT_STRING, ..] if (2..=data.len()).contains(&(*len as usize)) => {
            Ok(&data[2..*len as usize])
        }
        _ => Err(DfuError::MalformedDescriptor(
            "invalid string descriptor".into(),
        )),
    }
}

fn get_descriptor<T: Transport>(
    transport: &mut T,
    descriptor_type: u8,
    index: u8,
    language: u16,
    length: u16,
) -> Result<Vec<u8>, DfuError> {
    let value = u16::from_be_bytes([descriptor_type, index]);
    let setup = ControlSetup::standard_device(GET_DESCRIPTOR, value, language);
    Ok(transport.control_in(setup, length)?)
}

fn default_language<T: Transport>(transport: &mut T) -> u16 {
    read_languages(transport)
        .ok()
        .and_then(|langs| langs.first().copied())
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH)
}

fn read_name<T: Transport>(
    transport: &mut T,
    index: u8,
    language: u16,
) -> Option<String> {
    if index == 0 {
        return None;
    }
    match read_string_descriptor(transport, index, language) {
        Ok(name) => Some(name),
        Err(err) => {
            debug!("failed to read interface string {index}: {err}");
            None
        }
    }
}

fn is_dfu_interface(intf: &InterfaceDescriptor) -> bool {
    intf.interface_class == DFU_CLASS
        && intf.interface_subclass == DFU_SUBCLASS
        && (intf.interface_protocol == DFU_PROTOCOL_RUNTIME
            || intf.interface_protocol == DFU_PROTOCOL_DFU_MODE)
}

/// Every DFU alternate setting of every configuration of the device.
pub fn find_dfu_interfaces<T: Transport>(
    transport: &mut T,
) -> Result<Vec<InterfaceSetting>, DfuError> {
    let device = read_device_descriptor(transport)?;
    let language = default_language(transport);

    let mut settings = Vec::new();
    for index in 0..device.num_configurations {
        let config = read_configuration_descriptor(transport, index)?;
        for intf in config.interfaces().filter(|i| is_dfu_interface(i)) {
            let mut setting = InterfaceSetting {
                name: None,
                configuration: config.configuration_value,
                configuration_index: index,
                interface: intf.interface_number,
                alternate: intf.alternate_setting,
                protocol: intf.interface_protocol,
                string_index: intf.interface_index,
                memory: None,
            };
            if let Some(name) =
                read_name(transport, setting.string_index, language)
            {
                setting.set_name(name);
            }
            debug!(
                "found DFU interface {}/{} in configuration {}: {:?}",
                setting.interface,
                setting.alternate,
                setting.configuration,
                setting.name
            );
            settings.push(setting);
        }
    }
    Ok(settings)
}

/// Some devices only answer string requests for the active
/// configuration. Select the first one and read the missing names again.
pub fn fix_interface_names<T: Transport>(
    transport: &mut T,
    settings: &mut [InterfaceSetting],
) -> Result<(), DfuError> {
    if settings.iter().all(|s| s.name.is_some()) {
        return Ok(());
    }
    let Some(first) = settings.first() else {
        return Ok(());
    };
    transport.select_configuration(first.configuration)?;
    let language = default_language(transport);
    for setting in settings.iter_mut().filter(|s| s.name.is_none()) {
        if let Some(name) =
            read_name(transport, setting.string_index, language)
        {
            setting.set_name(name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    const LAYOUT: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg";

    #[test]
    fn test_find_dfu_interfaces() {
        let mut dev = MockDevice::dfuse(LAYOUT)
            .with_alternate("@Option Bytes  /0x1FFFC000/01*016 a");
        let settings = find_dfu_interfaces(&mut dev).unwrap();
        assert_eq!(settings.len(), 2);

        let flash = &settings[0];
        assert_eq!(flash.name(), Some(LAYOUT));
        assert_eq!(flash.configuration(), 1);
        assert_eq!(flash.interface(), 0);
        assert_eq!(flash.alternate(), 0);
        assert_eq!(flash.protocol(), 2);
        let map = flash.memory().unwrap();
        assert_eq!(map.name, "Internal Flash");
        assert_eq!(map.segments.len(), 5);

        let option_bytes = settings[1].memory().unwrap();
        assert_eq!(settings[1].alternate(), 1);
        assert_eq!(option_bytes.segments.first().start_addr(), 0x1FFF_C000);
        assert!(!option_bytes.segments.first().writable());
    }

    #[test]
    fn test_plain_dfu_name_has_no_memory_map() {
        let mut dev = MockDevice::dfu();
        let settings = find_dfu_interfaces(&mut dev).unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].name(), Some("DFU firmware"));
        assert!(settings[0].memory().is_none());
    }

    #[test]
    fn test_read_configuration_descriptor() {
        let mut dev = MockDevice::dfu();
        let config = read_configuration_descriptor(&mut dev, 0).unwrap();
        assert_eq!(config.consumed_len(), config.total_length as usize);
        assert_eq!(config.interfaces().count(), 1);
        assert!(config.functional_descriptor(0, 0).is_some());
    }

    #[test]
    fn test_string_descriptors() {
        let mut dev = MockDevice::dfu();
        assert_eq!(read_languages(&mut dev).unwrap(), vec![0x0409]);
        assert_eq!(
            read_string_descriptor(&mut dev, 1, 0x0409).unwrap(),
            "DFU firmware"
        );
        assert!(read_string_descriptor(&mut dev, 9, 0x0409).is_err());
    }

    #[test]
    fn test_short_string_descriptor_is_rejected() {
        let replies: [&[u8]; 3] =
            [&[0x01, DT_STRING], &[0x00, DT_STRING], &[0x02]];
        for raw in replies {
            let mut dev = MockDevice::dfu().with_raw_string(1, raw);
            assert!(matches!(
                read_string_descriptor(&mut dev, 1, 0x0409),
                Err(DfuError::MalformedDescriptor(_))
            ));
        }

        let mut dev =
            MockDevice::dfu().with_raw_string(1, &[0x01, DT_STRING]);
        let settings = find_dfu_interfaces(&mut dev).unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].name(), None);
    }

    #[test]
    fn test_empty_string_descriptor() {
        let mut dev =
            MockDevice::dfu().with_raw_string(1, &[0x02, DT_STRING]);
        assert_eq!(
            read_string_descriptor(&mut dev, 1, 0x0409).unwrap(),
            ""
        );
    }

    #[test]
    fn test_fix_interface_names() {
        let mut dev = MockDevice::dfuse(LAYOUT)
            .with_alternate("@Option Bytes  /0x1FFFC000/01*016 a")
            .strings_need_configuration();
        let mut settings = find_dfu_interfaces(&mut dev).unwrap();
        assert!(settings.iter().all(|s| s.name().is_none()));
        assert!(settings.iter().all(|s| s.memory().is_none()));
        assert_eq!(dev.configuration(), None);

        fix_interface_names(&mut dev, &mut settings).unwrap();
        assert_eq!(dev.configuration(), Some(1));
        assert_eq!(settings[0].name(), Some(LAYOUT));
        assert_eq!(settings[0].memory().unwrap().segments.len(), 5);
        let option_bytes = settings[1].memory().unwrap();
        assert_eq!(option_bytes.segments.first().start_addr(), 0x1FFF_C000);
    }

    #[test]
    fn test_fix_interface_names_keeps_known_names() {
        let mut dev = MockDevice::dfu();
        let mut settings = find_dfu_interfaces(&mut dev).unwrap();
        fix_interface_names(&mut dev, &mut settings).unwrap();
        assert_eq!(dev.configuration(), None);
        assert_eq!(settings[0].name(), Some("DFU firmware"));
    }
}
