// Hand-curated subset of the Bluetooth SIG assigned numbers covering the GATT
// core and the LE Audio control services.

uuid16_enum! {
    /// GATT services ([Assigned Numbers] Section 3.4.2).
    pub enum Service {
        GenericAccess = 0x1800,
        GenericAttribute = 0x1801,
        AudioInputControl = 0x1843,
        VolumeControl = 0x1844,
        VolumeOffsetControl = 0x1845,
        CoordinatedSetIdentification = 0x1846,
        AudioStreamControl = 0x184E,
    }
}

uuid16_enum! {
    /// Declarations ([Assigned Numbers] Section 3.6).
    pub enum Declaration {
        PrimaryService = 0x2800,
        SecondaryService = 0x2801,
        Include = 0x2802,
        Characteristic = 0x2803,
    }
}

uuid16_enum! {
    /// Descriptors ([Assigned Numbers] Section 3.7).
    pub enum Descriptor {
        CharacteristicExtendedProperties = 0x2900,
        CharacteristicUserDescription = 0x2901,
        ClientCharacteristicConfiguration = 0x2902,
        ServerCharacteristicConfiguration = 0x2903,
        CharacteristicPresentationFormat = 0x2904,
        CharacteristicAggregateFormat = 0x2905,
    }
}

uuid16_enum! {
    /// Characteristics ([Assigned Numbers] Section 3.8.2).
    pub enum Characteristic {
        DeviceName = 0x2A00,
        Appearance = 0x2A01,
        ServiceChanged = 0x2A05,
        AudioInputState = 0x2B77,
        GainSettings = 0x2B78,
        AudioInputType = 0x2B79,
        AudioInputStatus = 0x2B7A,
        AudioInputControlPoint = 0x2B7B,
        AudioInputDescription = 0x2B7C,
        VolumeState = 0x2B7D,
        VolumeControlPoint = 0x2B7E,
        VolumeFlags = 0x2B7F,
        VolumeOffsetState = 0x2B80,
        AudioLocation = 0x2B81,
        VolumeOffsetControlPoint = 0x2B82,
        AudioOutputDescription = 0x2B83,
        SetIdentityResolvingKey = 0x2B84,
        CoordinatedSetSize = 0x2B85,
        SetMemberLock = 0x2B86,
        SetMemberRank = 0x2B87,
        SinkAse = 0x2BC4,
        SourceAse = 0x2BC5,
        AseControlPoint = 0x2BC6,
    }
}
