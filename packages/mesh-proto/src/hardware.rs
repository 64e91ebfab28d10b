//! Hardware-model enum to symbolic board names.

/// Map a hardware-model enum value to its symbolic name.
///
/// Zero means "unset" and yields `None`; values missing from the table come
/// back as `UNKNOWN_<n>` so new boards still land in the database with a
/// stable label.
pub fn hardware_model_name(model: i32) -> Option<String> {
    if model == 0 {
        return None;
    }
    let name = match model {
        1 => "TLORA_V2",
        2 => "TLORA_V1",
        3 => "TLORA_V2_1_1P6",
        4 => "TBEAM",
        5 => "HELTEC_V2_0",
        6 => "TBEAM_V0P7",
        7 => "T_ECHO",
        8 => "TLORA_V1_1P3",
        9 => "RAK4631",
        10 => "HELTEC_V2_1",
        11 => "HELTEC_V1",
        12 => "LILYGO_TBEAM_S3_CORE",
        13 => "RAK11200",
        14 => "NANO_G1",
        15 => "TLORA_V2_1_1P8",
        16 => "TLORA_T3_S3",
        17 => "NANO_G1_EXPLORER",
        18 => "NANO_G2_ULTRA",
        25 => "STATION_G1",
        26 => "RAK11310",
        29 => "CANARYONE",
        30 => "RP2040_LORA",
        31 => "STATION_G2",
        39 => "DIY_V1",
        42 => "M5STACK",
        43 => "HELTEC_V3",
        44 => "HELTEC_WSL_V3",
        47 => "RPI_PICO",
        48 => "HELTEC_WIRELESS_TRACKER",
        49 => "HELTEC_WIRELESS_PAPER",
        50 => "T_DECK",
        51 => "T_WATCH_S3",
        52 => "PICOMPUTER_S3",
        53 => "HELTEC_HT62",
        255 => "PRIVATE_HW",
        n => return Some(format!("UNKNOWN_{n}")),
    };
    Some(name.to_string())
}
