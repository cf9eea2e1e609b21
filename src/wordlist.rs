//! Human-typable codes for a slot number and an ephemeral password.
//!
//! A code is the varint encoding of the slot number followed by the raw
//! password bytes, with every byte mapped to a word from the PGP word
//! lists. Bytes at even positions use the two-syllable list, bytes at
//! odd positions the three-syllable list, so a dropped or doubled word
//! is caught by the alternation alone.

/// Slots are allocated from at most 21 bits so codes stay short.
pub const MAX_SLOT: usize = (1 << 21) - 1;

/// Encode a slot number and password into a dash-separated code.
pub fn encode(slot: usize, pass: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(4 + pass.len());
    put_uvarint(&mut bytes, slot as u64);
    bytes.extend_from_slice(pass);

    let words: Vec<&str> = bytes
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if i % 2 == 0 {
                EVEN_WORDS[b as usize]
            } else {
                ODD_WORDS[b as usize]
            }
        })
        .collect();
    words.join("-")
}

/// Decode a code back into its slot number and password.
///
/// Any unparseable input yields `None`, which callers treat as a
/// permanent error: retrying a mistyped code cannot help.
pub fn decode(code: &str) -> Option<(usize, Vec<u8>)> {
    let words: Vec<&str> = code
        .split(|c: char| c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return None;
    }

    let mut bytes = Vec::with_capacity(words.len());
    for (i, word) in words.iter().enumerate() {
        let list = if i % 2 == 0 { &EVEN_WORDS } else { &ODD_WORDS };
        let b = list
            .iter()
            .position(|w| w.eq_ignore_ascii_case(word))?;
        bytes.push(b as u8);
    }

    let (slot, n) = uvarint(&bytes)?;
    if slot > MAX_SLOT as u64 || n >= bytes.len() {
        // Slot out of range, or no password bytes left over.
        return None;
    }
    Some((slot as usize, bytes[n..].to_vec()))
}

fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        buf.push(x as u8 | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
}

fn uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, &b) in buf.iter().enumerate() {
        if s >= 63 {
            return None;
        }
        if b < 0x80 {
            return Some((x | (b as u64) << s, i + 1));
        }
        x |= ((b & 0x7f) as u64) << s;
        s += 7;
    }
    None
}

// The PGP word lists: 256 two-syllable words for even byte positions and
// 256 three-syllable words for odd positions.

#[rustfmt::skip]
const EVEN_WORDS: [&str; 256] = [
    "aardvark", "absurd", "accrue", "acme", "adrift", "adult", "afflict", "ahead",
    "aimless", "Algol", "allow", "alone", "ammo", "ancient", "apple", "artist",
    "assume", "Athens", "atlas", "Aztec", "baboon", "backfield", "backward", "banjo",
    "beaming", "bedlamp", "beehive", "beeswax", "befriend", "Belfast", "berserk", "billiard",
    "bison", "blackjack", "blockade", "blowtorch", "bluebird", "bombast", "bookshelf", "brackish",
    "breadline", "breakup", "brickyard", "briefcase", "Burbank", "button", "buzzard", "cement",
    "chairlift", "chatter", "checkup", "chisel", "choking", "chopper", "Christmas", "clamshell",
    "classic", "classroom", "cleanup", "clockwork", "cobra", "commence", "concert", "cowbell",
    "crackdown", "cranky", "crowfoot", "crucial", "crumpled", "crusade", "cubic", "dashboard",
    "deadbolt", "deckhand", "dogsled", "dragnet", "drainage", "dreadful", "drifter", "dropper",
    "drumbeat", "drunken", "Dupont", "dwelling", "eating", "edict", "egghead", "eightball",
    "endorse", "endow", "enlist", "erase", "escape", "exceed", "eyeglass", "eyetooth",
    "facial", "fallout", "flagpole", "flatfoot", "flytrap", "fracture", "framework", "freedom",
    "frighten", "gazelle", "Geiger", "glitter", "glucose", "goggles", "goldfish", "gremlin",
    "guidance", "hamlet", "highchair", "hockey", "indoors", "indulge", "inverse", "involve",
    "island", "jawbone", "keyboard", "kickoff", "kiwi", "klaxon", "locale", "lockup",
    "merit", "minnow", "miser", "Mohawk", "mural", "music", "necklace", "Neptune",
    "newborn", "nightbird", "Oakland", "obtuse", "offload", "optic", "orca", "payday",
    "peachy", "pheasant", "physique", "playhouse", "Pluto", "preclude", "prefer", "preshrunk",
    "printer", "prowler", "pupil", "puppy", "python", "quadrant", "quiver", "quota",
    "ragtime", "ratchet", "rebirth", "reform", "regain", "reindeer", "rematch", "repay",
    "retouch", "revenge", "reward", "rhythm", "ribcage", "ringbolt", "robust", "rocker",
    "ruffled", "sailboat", "sawdust", "scallion", "scenic", "scorecard", "Scotland", "seabird",
    "select", "sentence", "shadow", "shamrock", "showgirl", "skullcap", "skydive", "slingshot",
    "slowdown", "snapline", "snapshot", "snowcap", "snowslide", "solo", "southward", "soybean",
    "spaniel", "spearhead", "spellbind", "spheroid", "spigot", "spindle", "spyglass", "stagehand",
    "stagnate", "stairway", "standard", "stapler", "steamship", "sterling", "stockman", "stopwatch",
    "stormy", "sugar", "surmount", "suspense", "sweatband", "swelter", "tactics", "talon",
    "tapeworm", "tempest", "tiger", "tissue", "tonic", "topmost", "tracker", "transit",
    "trauma", "treadmill", "Trojan", "trouble", "tumor", "tunnel", "tycoon", "uncut",
    "unearth", "unwind", "uproot", "upset", "upshot", "vapor", "village", "virus",
    "Vulcan", "waffle", "wallet", "watchword", "wayside", "willow", "woodlark", "Zulu",
];

#[rustfmt::skip]
const ODD_WORDS: [&str; 256] = [
    "adroitness", "adviser", "aftermath", "aggregate", "alkali", "almighty", "amulet", "amusement",
    "antenna", "applicant", "Apollo", "armistice", "article", "asteroid", "Atlantic", "atmosphere",
    "autopsy", "Babylon", "backwater", "barbecue", "belowground", "bifocals", "bodyguard", "bookseller",
    "borderline", "bottomless", "Bradbury", "bravado", "Brazilian", "breakaway", "Burlington", "businessman",
    "butterfat", "Camelot", "candidate", "cannonball", "Capricorn", "caravan", "caretaker", "celebrate",
    "cellulose", "certify", "chambermaid", "Cherokee", "Chicago", "clergyman", "coherence", "combustion",
    "commando", "company", "component", "concurrent", "confidence", "conformist", "congregate", "consensus",
    "consulting", "corporate", "corrosion", "councilman", "crossover", "crucifix", "cumbersome", "customer",
    "Dakota", "decadence", "December", "decimal", "designing", "detector", "detergent", "determine",
    "dictator", "dinosaur", "direction", "disable", "disbelief", "disruptive", "distortion", "document",
    "embezzle", "enchanting", "enrollment", "enterprise", "equation", "equipment", "escapade", "Eskimo",
    "everyday", "examine", "existence", "exodus", "fascinate", "filament", "finicky", "forever",
    "fortitude", "frequency", "gadgetry", "Galveston", "getaway", "glossary", "gossamer", "graduate",
    "gravity", "guitarist", "hamburger", "Hamilton", "handiwork", "hazardous", "headwaters", "hemisphere",
    "hesitate", "hideaway", "holiness", "hurricane", "hydraulic", "impartial", "impetus", "inception",
    "indigo", "inertia", "infancy", "inferno", "informant", "insincere", "insurgent", "integrate",
    "intention", "inventive", "Istanbul", "Jamaica", "Jupiter", "leprosy", "letterhead", "liberty",
    "maritime", "matchmaker", "maverick", "Medusa", "megaton", "microscope", "microwave", "midsummer",
    "millionaire", "miracle", "misnomer", "molasses", "molecule", "Montana", "monument", "mosquito",
    "narrative", "nebula", "newsletter", "Norwegian", "October", "Ohio", "onlooker", "opulent",
    "Orlando", "outfielder", "Pacific", "pandemic", "Pandora", "paperweight", "paragon", "paragraph",
    "paramount", "passenger", "pedigree", "Pegasus", "penetrate", "perceptive", "performance", "pharmacy",
    "phonetic", "photograph", "pioneer", "pocketful", "politeness", "positive", "potato", "processor",
    "provincial", "proximate", "puberty", "publisher", "pyramid", "quantity", "racketeer", "rebellion",
    "recipe", "recover", "repellent", "replica", "reproduce", "resistor", "responsive", "retraction",
    "retrieval", "retrospect", "revenue", "revival", "revolver", "sandalwood", "sardonic", "Saturday",
    "savagery", "scavenger", "sensation", "sociable", "souvenir", "specialist", "speculate", "stethoscope",
    "stupendous", "supportive", "surrender", "suspicious", "sympathy", "tambourine", "telephone", "therapist",
    "tobacco", "tolerance", "tomorrow", "torpedo", "tradition", "travesty", "trombonist", "truncated",
    "typewriter", "ultimate", "undaunted", "underfoot", "unicorn", "unify", "universe", "unravel",
    "upcoming", "vacancy", "vagabond", "vertigo", "Virginia", "visitor", "vocalist", "voyager",
    "warranty", "Waterloo", "whimsical", "Wichita", "Wilmington", "Wyoming", "yesteryear", "Yucatan",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_lists_are_complete_and_unique() {
        for list in [&EVEN_WORDS, &ODD_WORDS] {
            let mut sorted: Vec<String> =
                list.iter().map(|w| w.to_ascii_lowercase()).collect();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), 256);
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for slot in [0usize, 1, 127, 128, 2047, 2048, 65535, MAX_SLOT] {
            for pass in [&b"ab"[..], &b"\x00\xff"[..], &b"longer password"[..]] {
                let code = encode(slot, pass);
                let (got_slot, got_pass) =
                    decode(&code).expect("generated code should decode");
                assert_eq!(got_slot, slot, "code: {}", code);
                assert_eq!(got_pass, pass, "code: {}", code);
            }
        }
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let code = encode(57, b"xy").to_uppercase();
        let (slot, pass) = decode(&code).unwrap();
        assert_eq!(slot, 57);
        assert_eq!(pass, b"xy");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("-"), None);
        assert_eq!(decode("notaword-nebula"), None);
        // Alternation violated: two words from the even list in a row.
        assert_eq!(decode("aardvark-aardvark"), None);
    }

    #[test]
    fn test_decode_rejects_code_without_password() {
        // A single word only carries the slot varint.
        assert_eq!(decode("aardvark"), None);
    }

    #[test]
    fn test_decode_accepts_spaces() {
        let code = encode(300, b"pw").replace('-', " ");
        assert_eq!(decode(&code), Some((300, b"pw".to_vec())));
    }

    #[test]
    fn test_small_slots_encode_short() {
        // One varint byte plus a two byte password is three words.
        assert_eq!(encode(5, b"ab").split('-').count(), 3);
        // Three varint bytes at the top of the 21-bit slot range.
        assert_eq!(encode(MAX_SLOT, b"ab").split('-').count(), 5);
    }

    #[test]
    fn test_uvarint_roundtrip() {
        for x in [0u64, 1, 127, 128, 300, 1 << 20, u64::from(u32::MAX)] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, x);
            assert_eq!(uvarint(&buf), Some((x, buf.len())));
        }
    }
}
