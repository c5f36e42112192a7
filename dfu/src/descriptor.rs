use crate::error::{DfuError, malformed};

pub(crate) const DT_DEVICE: u8 = 0x01;
pub(crate) const DT_CONFIGURATION: u8 = 0x02;
pub(crate) const DT_STRING: u8 = 0x03;
pub(crate) const DT_INTERFACE: u8 = 0x04;

pub(crate) const DFU_DESC_TYPE: u8 = 0x21;
pub(crate) const DFU_DESC_LEN: usize = 9;
const DFU_DESC_LEGACY_LEN: usize = 7;

pub(crate) const DEVICE_DESC_LEN: usize = 18;
pub(crate) const CONFIGURATION_DESC_LEN: usize = 9;
const INTERFACE_DESC_LEN: usize = 9;

pub(crate) const DFU_CLASS: u8 = 0xFE;
pub(crate) const DFU_SUBCLASS: u8 = 0x01;
pub(crate) const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub(crate) const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

pub const DFU_VERSION_NUMBER: u16 = 0x100;
pub const DFUSE_VERSION_NUMBER: u16 = 0x11A;

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Standard USB device descriptor (USB 2.0, 9.6.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    #[doc(alias = "bcdUSB")]
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    #[doc(alias = "bMaxPacketSize0")]
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    #[doc(alias = "bcdDevice")]
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

pub fn parse_device_descriptor(
    data: &[u8],
) -> Result<DeviceDescriptor, DfuError> {
    if data.len() < DEVICE_DESC_LEN {
        return Err(malformed(format!(
            "device descriptor is {} bytes, expected {DEVICE_DESC_LEN}",
            data.len()
        )));
    }
    let length = data[0];
    if (length as usize) < DEVICE_DESC_LEN || data.len() < length as usize {
        return Err(malformed(format!(
            "device descriptor bLength {length} does not match {} bytes",
            data.len()
        )));
    }
    Ok(DeviceDescriptor {
        length,
        descriptor_type: data[1],
        usb_version: u16_at(data, 2),
        device_class: data[4],
        device_subclass: data[5],
        device_protocol: data[6],
        max_packet_size: data[7],
        vendor_id: u16_at(data, 8),
        product_id: u16_at(data, 10),
        device_version: u16_at(data, 12),
        manufacturer_index: data[14],
        product_index: data[15],
        serial_number_index: data[16],
        num_configurations: data[17],
    })
}

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    length: u8,
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl FunctionalDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    pub fn length(&self) -> u8 {
        self.length
    }

    #[doc(alias = "bmAttributes")]
    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a
    /// USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of the
    /// `DFU_DETACH` request (`wDetachTimeOut`).
    #[doc(alias = "wDetachTimeOut")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write
    /// transaction (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification
    /// release (`bcdDFUVersion`). DFU 1.0 descriptors stop before this
    /// field, they report 1.0.
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }
}

pub fn parse_functional_descriptor(
    data: &[u8],
) -> Result<FunctionalDescriptor, DfuError> {
    if data.len() < DFU_DESC_LEGACY_LEN {
        return Err(malformed(format!(
            "functional descriptor is {} bytes",
            data.len()
        )));
    }
    let length = data[0] as usize;
    if length < DFU_DESC_LEGACY_LEN || data.len() < length {
        return Err(malformed(format!(
            "functional descriptor bLength {length} does not match {} bytes",
            data.len()
        )));
    }
    Ok(FunctionalDescriptor {
        length: data[0],
        attributes: data[2],
        detach_timeout: u16_at(data, 3),
        transfer_size: u16_at(data, 5),
        dfu_version: if length >= DFU_DESC_LEN {
            u16_at(data, 7)
        } else {
            DFU_VERSION_NUMBER
        },
    })
}

/// Descriptor the parser does not interpret. `data` holds the whole
/// descriptor, header included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDescriptor {
    pub descriptor_type: u8,
    pub data: Vec<u8>,
}

/// One entry of a configuration's descriptor list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    Functional(FunctionalDescriptor),
    Other(RawDescriptor),
}

impl Descriptor {
    /// `bLength` of the record, i.e. how far the parser advanced over it.
    pub fn len(&self) -> usize {
        match self {
            Descriptor::Interface(intf) => intf.length as usize,
            Descriptor::Functional(func) => func.length as usize,
            Descriptor::Other(raw) => raw.data.len(),
        }
    }

    pub fn descriptor_type(&self) -> u8 {
        match self {
            Descriptor::Interface(_) => DT_INTERFACE,
            Descriptor::Functional(_) => DFU_DESC_TYPE,
            Descriptor::Other(raw) => raw.descriptor_type,
        }
    }
}

/// Standard interface descriptor and the class-specific descriptors that
/// follow it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    #[doc(alias = "iInterface")]
    pub interface_index: u8,
    pub descriptors: Vec<Descriptor>,
}

impl InterfaceDescriptor {
    pub fn is_dfu(&self) -> bool {
        self.interface_class == DFU_CLASS
            && self.interface_subclass == DFU_SUBCLASS
    }

    pub fn functional_descriptor(&self) -> Option<&FunctionalDescriptor> {
        self.descriptors.iter().find_map(|desc| match desc {
            Descriptor::Functional(func) => Some(func),
            _ => None,
        })
    }
}

fn parse_interface_header(
    data: &[u8],
) -> Result<InterfaceDescriptor, DfuError> {
    if data.len() < INTERFACE_DESC_LEN {
        return Err(malformed(format!(
            "interface descriptor is {} bytes",
            data.len()
        )));
    }
    Ok(InterfaceDescriptor {
        length: data[0],
        interface_number: data[2],
        alternate_setting: data[3],
        num_endpoints: data[4],
        interface_class: data[5],
        interface_subclass: data[6],
        interface_protocol: data[7],
        interface_index: data[8],
        descriptors: Vec::new(),
    })
}

/// Parse an interface descriptor together with the sub-descriptors that
/// trail it, up to the next interface descriptor.
pub fn parse_interface_descriptor(
    data: &[u8],
) -> Result<InterfaceDescriptor, DfuError> {
    match parse_sub_descriptors(data)?.into_iter().next() {
        Some(Descriptor::Interface(intf)) => Ok(intf),
        _ => Err(malformed("not an interface descriptor")),
    }
}

/// Splits a descriptor list into records using each record's `bLength`.
struct DescriptorChunks<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DescriptorChunks<'a> {
    type Item = Result<&'a [u8], DfuError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let len = self.remaining[0] as usize;
        let err = if self.remaining.len() < 2 {
            Some(malformed("truncated descriptor header"))
        } else if len < 2 {
            Some(malformed(format!("descriptor with bLength {len}")))
        } else if len > self.remaining.len() {
            Some(malformed(format!(
                "descriptor bLength {len} exceeds the {} remaining bytes",
                self.remaining.len()
            )))
        } else {
            None
        };
        if let Some(err) = err {
            self.remaining = &[];
            return Some(Err(err));
        }
        let (chunk, rest) = self.remaining.split_at(len);
        self.remaining = rest;
        Some(Ok(chunk))
    }
}

/// Walk a descriptor list and classify every record.
///
/// Functional descriptors are only recognised inside a DFU interface, since
/// type 0x21 means something else for other classes (HID). Records that
/// follow an interface descriptor are also attached to it.
pub fn parse_sub_descriptors(data: &[u8]) -> Result<Vec<Descriptor>, DfuError> {
    let mut descriptors: Vec<Descriptor> = Vec::new();
    let mut current: Option<usize> = None;

    for chunk in (DescriptorChunks { remaining: data }) {
        let chunk = chunk?;
        let descriptor_type = chunk[1];

        if descriptor_type == DT_INTERFACE {
            current = Some(descriptors.len());
            descriptors.push(Descriptor::Interface(parse_interface_header(
                chunk,
            )?));
            continue;
        }

        let in_dfu_interface = matches!(
            current.and_then(|i| descriptors.get(i)),
            Some(Descriptor::Interface(intf)) if intf.is_dfu()
        );
        let desc = if in_dfu_interface && descriptor_type == DFU_DESC_TYPE {
            Descriptor::Functional(parse_functional_descriptor(chunk)?)
        } else {
            Descriptor::Other(RawDescriptor {
                descriptor_type,
                data: chunk.to_vec(),
            })
        };
        if let Some(Descriptor::Interface(intf)) =
            current.and_then(|i| descriptors.get_mut(i))
        {
            intf.descriptors.push(desc.clone());
        }
        descriptors.push(desc);
    }

    Ok(descriptors)
}

/// Standard configuration descriptor followed by its flattened descriptor
/// list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    #[doc(alias = "iConfiguration")]
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub descriptors: Vec<Descriptor>,
}

impl ConfigurationDescriptor {
    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.descriptors.iter().filter_map(|desc| match desc {
            Descriptor::Interface(intf) => Some(intf),
            _ => None,
        })
    }

    /// Functional descriptor of the given alternate setting, or the first
    /// one found in the configuration.
    pub fn functional_descriptor(
        &self,
        interface: u8,
        alt_setting: u8,
    ) -> Option<&FunctionalDescriptor> {
        self.interfaces()
            .find(|intf| {
                intf.interface_number == interface
                    && intf.alternate_setting == alt_setting
            })
            .and_then(InterfaceDescriptor::functional_descriptor)
            .or_else(|| {
                self.descriptors.iter().find_map(|desc| match desc {
                    Descriptor::Functional(func) => Some(func),
                    _ => None,
                })
            })
    }

    /// Bytes covered by the header and the top level descriptor list.
    pub fn consumed_len(&self) -> usize {
        self.length as usize
            + self.descriptors.iter().map(Descriptor::len).sum::<usize>()
    }
}

pub fn parse_configuration_descriptor(
    data: &[u8],
) -> Result<ConfigurationDescriptor, DfuError> {
    if data.len() < CONFIGURATION_DESC_LEN {
        return Err(malformed(format!(
            "configuration descriptor is {} bytes",
            data.len()
        )));
    }
    let length = data[0] as usize;
    let total_length = u16_at(data, 2);
    if length < CONFIGURATION_DESC_LEN || length > total_length as usize {
        return Err(malformed(format!(
            "configuration descriptor bLength {length}, \
             wTotalLength {total_length}"
        )));
    }
    if data.len() < total_length as usize {
        return Err(malformed(format!(
            "configuration descriptor is {} bytes, \
             wTotalLength is {total_length}",
            data.len()
        )));
    }

    Ok(ConfigurationDescriptor {
        length: data[0],
        descriptor_type: data[1],
        total_length,
        num_interfaces: data[4],
        configuration_value: data[5],
        configuration_index: data[6],
        attributes: data[7],
        max_power: data[8],
        descriptors: parse_sub_descriptors(
            &data[length..total_length as usize],
        )?,
    })
}
