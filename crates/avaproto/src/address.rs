//! Address rules and the remote application's namespaces.

use thiserror::Error;

/// Prefix for avatar parameters: `/avatar/parameters/<Name>`.
pub const PARAMETER_PREFIX: &str = "/avatar/parameters/";

/// Avatar identity change; argument is the avatar id string.
pub const AVATAR_CHANGE: &str = "/avatar/change";

/// Prefix for physics-bone parameters: `/avatar/physbones/<Bone>/<Sub>`.
pub const PHYSBONE_PREFIX: &str = "/avatar/physbones/";

/// Chatbox text: (text, send immediately, play notification sound).
pub const CHATBOX_INPUT: &str = "/chatbox/input";

/// Chatbox typing indicator: (bool).
pub const CHATBOX_TYPING: &str = "/chatbox/typing";

/// Longest address we will put on the wire.
pub const MAX_ADDRESS_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("address must start with '/': {0}")]
    MissingLeadingSlash(String),

    #[error("address contains a path traversal sequence: {0}")]
    Traversal(String),

    #[error("address contains a backslash: {0}")]
    Backslash(String),

    #[error("address contains whitespace, control or reserved characters: {0}")]
    IllegalCharacter(String),

    #[error("address exceeds {MAX_ADDRESS_LEN} bytes")]
    TooLong,
}

/// Check an outgoing address: `/`-prefixed, no `..`, no `\`, no whitespace,
/// control characters or `#`.
pub fn validate_address(address: &str) -> Result<(), AddressError> {
    if address.is_empty() {
        return Err(AddressError::Empty);
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(AddressError::TooLong);
    }
    if !address.starts_with('/') {
        return Err(AddressError::MissingLeadingSlash(address.to_string()));
    }
    if address.contains("..") {
        return Err(AddressError::Traversal(address.to_string()));
    }
    if address.contains('\\') {
        return Err(AddressError::Backslash(address.to_string()));
    }
    if address
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '#')
    {
        return Err(AddressError::IllegalCharacter(address.to_string()));
    }
    Ok(())
}

pub fn is_valid_address(address: &str) -> bool {
    validate_address(address).is_ok()
}

/// Full address for an avatar parameter. Names that are already addresses
/// pass through untouched.
pub fn parameter_address(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}{}", PARAMETER_PREFIX, name)
    }
}

/// Parameter name for an `/avatar/parameters/<Name>` address.
pub fn parameter_name(address: &str) -> Option<&str> {
    address
        .strip_prefix(PARAMETER_PREFIX)
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

/// The sub-parameters a physics bone exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysBoneSub {
    Angle,
    Stretch,
    IsGrabbed,
    IsPosed,
    Squish,
}

impl PhysBoneSub {
    pub const ALL: [PhysBoneSub; 5] = [
        PhysBoneSub::Angle,
        PhysBoneSub::Stretch,
        PhysBoneSub::IsGrabbed,
        PhysBoneSub::IsPosed,
        PhysBoneSub::Squish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhysBoneSub::Angle => "Angle",
            PhysBoneSub::Stretch => "Stretch",
            PhysBoneSub::IsGrabbed => "IsGrabbed",
            PhysBoneSub::IsPosed => "IsPosed",
            PhysBoneSub::Squish => "Squish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|sub| sub.as_str() == s)
    }
}

impl std::fmt::Display for PhysBoneSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn physbone_address(bone: &str, sub: PhysBoneSub) -> String {
    format!("{}{}/{}", PHYSBONE_PREFIX, bone, sub.as_str())
}

/// Split `/avatar/physbones/<Bone>/<Sub>` into its bone name and sub-parameter.
///
/// Also accepts the flattened `/avatar/parameters/<Bone>_<Sub>` form avatars
/// use when the bone's parameter is exposed as a plain parameter.
pub fn parse_physbone_address(address: &str) -> Option<(&str, PhysBoneSub)> {
    if let Some(rest) = address.strip_prefix(PHYSBONE_PREFIX) {
        let (bone, sub) = rest.split_once('/')?;
        if bone.is_empty() {
            return None;
        }
        return PhysBoneSub::parse(sub).map(|sub| (bone, sub));
    }

    let name = parameter_name(address)?;
    let (bone, sub) = name.rsplit_once('_')?;
    if bone.is_empty() {
        return None;
    }
    PhysBoneSub::parse(sub).map(|sub| (bone, sub))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_addresses() {
        assert!(is_valid_address("/avatar/parameters/Wave"));
        assert!(is_valid_address("/avatar/change"));
        assert!(is_valid_address("/chatbox/input"));
        assert!(is_valid_address("/"));
    }

    #[test]
    fn rejects_unsafe_addresses() {
        assert_eq!(validate_address(""), Err(AddressError::Empty));
        assert!(matches!(
            validate_address("avatar/parameters/Wave"),
            Err(AddressError::MissingLeadingSlash(_))
        ));
        assert!(matches!(
            validate_address("/avatar/../etc/passwd"),
            Err(AddressError::Traversal(_))
        ));
        assert!(matches!(
            validate_address("/avatar\\parameters"),
            Err(AddressError::Backslash(_))
        ));
        assert!(matches!(
            validate_address("/avatar/parameters/Has Space"),
            Err(AddressError::IllegalCharacter(_))
        ));
        assert!(matches!(
            validate_address("/#bundle"),
            Err(AddressError::IllegalCharacter(_))
        ));
        let long = format!("/{}", "a".repeat(MAX_ADDRESS_LEN));
        assert_eq!(validate_address(&long), Err(AddressError::TooLong));
    }

    #[test]
    fn parameter_addresses() {
        assert_eq!(parameter_address("Hearts"), "/avatar/parameters/Hearts");
        assert_eq!(parameter_address("/custom/thing"), "/custom/thing");
        assert_eq!(parameter_name("/avatar/parameters/Hearts"), Some("Hearts"));
        assert_eq!(parameter_name("/avatar/parameters/"), None);
        assert_eq!(parameter_name("/avatar/change"), None);
    }

    #[test]
    fn physbone_addresses() {
        assert_eq!(
            physbone_address("Tail", PhysBoneSub::Angle),
            "/avatar/physbones/Tail/Angle"
        );
        assert_eq!(
            parse_physbone_address("/avatar/physbones/Tail/IsGrabbed"),
            Some(("Tail", PhysBoneSub::IsGrabbed))
        );
        assert_eq!(
            parse_physbone_address("/avatar/parameters/Ear_L_Stretch"),
            Some(("Ear_L", PhysBoneSub::Stretch))
        );
        assert_eq!(parse_physbone_address("/avatar/physbones/Tail/Color"), None);
        assert_eq!(parse_physbone_address("/avatar/parameters/Wave"), None);
        assert_eq!(parse_physbone_address("/avatar/physbones//Angle"), None);
    }
}
