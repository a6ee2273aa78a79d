//! Well-known kernel and system trace providers
//!
//! Used to fill in whichever identifier (friendly name or GUID) a source
//! definition leaves out.

use uuid::Uuid;

pub const KERNEL_PROCESS: &str = "Microsoft-Windows-Kernel-Process";
pub const KERNEL_NETWORK: &str = "Microsoft-Windows-Kernel-Network";
pub const KERNEL_FILE: &str = "Microsoft-Windows-Kernel-File";
pub const KERNEL_REGISTRY: &str = "Microsoft-Windows-Kernel-Registry";
pub const DNS_CLIENT: &str = "Microsoft-Windows-DNS-Client";
pub const POWERSHELL: &str = "Microsoft-Windows-PowerShell";
pub const WMI_ACTIVITY: &str = "Microsoft-Windows-WMI-Activity";

pub const KERNEL_PROCESS_ID: Uuid = Uuid::from_u128(0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716);
pub const KERNEL_NETWORK_ID: Uuid = Uuid::from_u128(0x7dd42a49_5329_4832_8dfd_43d979153a88);
pub const KERNEL_FILE_ID: Uuid = Uuid::from_u128(0xedd08927_9cc4_4e65_b970_c2560fb5c289);
pub const KERNEL_REGISTRY_ID: Uuid = Uuid::from_u128(0x70eb4f03_c1de_4f73_a051_33d13d5413bd);
pub const DNS_CLIENT_ID: Uuid = Uuid::from_u128(0x1c95126e_7eea_49a9_a3fe_a378b03ddb4d);
pub const POWERSHELL_ID: Uuid = Uuid::from_u128(0xa0c1853b_5c40_4b15_8766_3cf1c58f985a);
pub const WMI_ACTIVITY_ID: Uuid = Uuid::from_u128(0x1418ef04_b0b4_4623_bf7e_d74ab47bbdaa);

const KNOWN: &[(&str, Uuid)] = &[
    (KERNEL_PROCESS, KERNEL_PROCESS_ID),
    (KERNEL_NETWORK, KERNEL_NETWORK_ID),
    (KERNEL_FILE, KERNEL_FILE_ID),
    (KERNEL_REGISTRY, KERNEL_REGISTRY_ID),
    (DNS_CLIENT, DNS_CLIENT_ID),
    (POWERSHELL, POWERSHELL_ID),
    (WMI_ACTIVITY, WMI_ACTIVITY_ID),
];

/// GUID of a well-known provider, matched case-insensitively by name
pub fn id_for_name(name: &str) -> Option<Uuid> {
    KNOWN
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|(_, id)| *id)
}

pub fn name_for_id(id: &Uuid) -> Option<&'static str> {
    KNOWN.iter().find(|(_, known)| known == id).map(|(name, _)| *name)
}

pub fn all() -> impl Iterator<Item = (&'static str, Uuid)> {
    KNOWN.iter().copied()
}
