//! Emoji fingerprint table used as an out-of-band human verification check
//! during pairing and invite approval.
//!
//! `emojiAlphabetSize = 256`, `emojiCodeLength = 6` (spec.md §6).

/// Ordered table of 256 emoji. Index `i` is byte value `i` of the digest.
pub const EMOJI_TABLE: [&str; 256] = [
    "😀", "😁", "😂", "😃", "😄", "😅", "😆", "😇",
    "😈", "😉", "😊", "😋", "😌", "😍", "😎", "😏",
    "😐", "😑", "😒", "😓", "😔", "😕", "😖", "😗",
    "😘", "😙", "😚", "😛", "😜", "😝", "😞", "😟",
    "😠", "😡", "😢", "😣", "😤", "😥", "😦", "😧",
    "😨", "😩", "😪", "😫", "😬", "😭", "😮", "😯",
    "😰", "😱", "😲", "😳", "😴", "😵", "😶", "😷",
    "😸", "😹", "😺", "😻", "😼", "😽", "😾", "😿",
    "🙀", "🙁", "🙂", "🙃", "🙄", "🙅", "🙆", "🙇",
    "🙈", "🙉", "🙊", "🙋", "🙌", "🙍", "🙎", "🙏",
    "🌀", "🌁", "🌂", "🌃", "🌄", "🌅", "🌆", "🌇",
    "🌈", "🌉", "🌊", "🌋", "🌌", "🌍", "🌎", "🌏",
    "🌐", "🌑", "🌒", "🌓", "🌔", "🌕", "🌖", "🌗",
    "🌘", "🌙", "🌚", "🌛", "🌜", "🌝", "🌞", "🌟",
    "🌠", "🌡", "🌢", "🌣", "🌤", "🌥", "🌦", "🌧",
    "🌨", "🌩", "🌪", "🌫", "🌬", "🌭", "🌮", "🌯",
    "🌰", "🌱", "🌲", "🌳", "🌴", "🌵", "🌶", "🌷",
    "🌸", "🌹", "🌺", "🌻", "🌼", "🌽", "🌾", "🌿",
    "🍀", "🍁", "🍂", "🍃", "🍄", "🍅", "🍆", "🍇",
    "🍈", "🍉", "🍊", "🍋", "🍌", "🍍", "🍎", "🍏",
    "🍐", "🍑", "🍒", "🍓", "🍔", "🍕", "🍖", "🍗",
    "🍘", "🍙", "🍚", "🍛", "🍜", "🍝", "🍞", "🍟",
    "🍠", "🍡", "🍢", "🍣", "🍤", "🍥", "🍦", "🍧",
    "🍨", "🍩", "🍪", "🍫", "🍬", "🍭", "🍮", "🍯",
    "🍰", "🍱", "🍲", "🍳", "🍴", "🍵", "🍶", "🍷",
    "🍸", "🍹", "🍺", "🍻", "🍼", "🍽", "🍾", "🍿",
    "🎀", "🎁", "🎂", "🎃", "🎄", "🎅", "🎆", "🎇",
    "🎈", "🎉", "🎊", "🎋", "🎌", "🎍", "🎎", "🎏",
    "🎐", "🎑", "🎒", "🎓", "🎔", "🎕", "🎖", "🎗",
    "🎘", "🎙", "🎚", "🎛", "🎜", "🎝", "🎞", "🎟",
    "🎠", "🎡", "🎢", "🎣", "🎤", "🎥", "🎦", "🎧",
    "🎨", "🎩", "🎪", "🎫", "🎬", "🎭", "🎮", "🎯",
];

pub const EMOJI_CODE_LENGTH: usize = 6;

/// 6-emoji fingerprint of `ipnsPub ‖ authPub`: `sha256(ipnsPub ‖ authPub)`,
/// first 6 bytes indexed into `EMOJI_TABLE`.
pub fn fingerprint(ipns_pub: &[u8], auth_pub: &[u8]) -> [&'static str; EMOJI_CODE_LENGTH] {
    let mut buf = Vec::with_capacity(ipns_pub.len() + auth_pub.len());
    buf.extend_from_slice(ipns_pub);
    buf.extend_from_slice(auth_pub);
    let digest = crate::hash::sha256(&buf);
    fingerprint_from_digest(&digest)
}

/// 6-emoji fingerprint over any already-hashed digest's first 6 bytes —
/// used by group invite approval, which fingerprints
/// `sha256(response)[0..5]` rather than a key concatenation.
pub fn fingerprint_from_digest(digest: &[u8; 32]) -> [&'static str; EMOJI_CODE_LENGTH] {
    let mut out = [""; EMOJI_CODE_LENGTH];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = EMOJI_TABLE[digest[i] as usize];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_six_emoji_and_stable() {
        let a = fingerprint(&[1u8; 32], &[2u8; 65]);
        let b = fingerprint(&[1u8; 32], &[2u8; 65]);
        assert_eq!(a.len(), EMOJI_CODE_LENGTH);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_input() {
        let a = fingerprint(&[1u8; 32], &[2u8; 65]);
        let b = fingerprint(&[9u8; 32], &[2u8; 65]);
        assert_ne!(a, b);
    }
}
