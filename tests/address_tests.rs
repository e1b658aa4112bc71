//! Address encoding scenarios: Base58Check and cashaddr round trips
//! over the two script template types, and the reject paths.

use cash_consensus::address::{Address, AddressType};
use cash_consensus::error::AddressError;
use cash_consensus::params::Params;

fn hash20(hex_str: &str) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&hex::decode(hex_str).unwrap());
    hash
}

#[test]
fn test_p2pkh_round_trip() {
    let params = Params::main();
    let address = Address::pubkey_hash(hash20("e34cce70c86373273efcc54ce7d2a491bb4a0e84"));

    assert_eq!(address.to_base58(&params), "1MirQ9bwyQcGVJPwKUgapu5ouK2E2Ey4gX");
    assert_eq!(
        address.to_cashaddr(&params),
        "bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgmkjswssk2puzvgv"
    );

    for encoded in [
        "1MirQ9bwyQcGVJPwKUgapu5ouK2E2Ey4gX",
        "bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgmkjswssk2puzvgv",
    ] {
        let parsed = Address::parse(encoded, &params).unwrap();
        assert_eq!(parsed, address);
        assert_eq!(parsed.ty, AddressType::PubkeyHash);
    }
}

#[test]
fn test_p2sh_round_trip() {
    let params = Params::main();
    let address = Address::script_hash(hash20("f815b036d9bbbce5e9f2a00abd1bf3dc91e95510"));

    assert_eq!(address.to_base58(&params), "3QJmV3qfvL9SuYo34YihAf3sRCW3qSinyC");
    assert_eq!(
        address.to_cashaddr(&params),
        "bitcoincash:pruptvpkmxamee0f72sq40gm70wfr624zq0yyxtycm"
    );

    for encoded in [
        "3QJmV3qfvL9SuYo34YihAf3sRCW3qSinyC",
        "bitcoincash:pruptvpkmxamee0f72sq40gm70wfr624zq0yyxtycm",
    ] {
        let parsed = Address::parse(encoded, &params).unwrap();
        assert_eq!(parsed, address);
        assert_eq!(parsed.ty, AddressType::ScriptHash);
    }
}

#[test]
fn test_cashaddr_mixed_case_rejected() {
    let params = Params::main();
    let err =
        Address::from_cashaddr("bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgMKJSWSSK2PUZVGV", &params)
            .unwrap_err();
    assert_eq!(err.to_string(), "Invalid cashaddr casing");
}

#[test]
fn test_cashaddr_non_zero_padding_rejected() {
    let params = Params::main();
    let err = Address::from_cashaddr("pruptvpkmxamee0f72sq40gm70wfr624zpu8adj8t6", &params)
        .unwrap_err();
    assert_eq!(err, AddressError::NonZeroPadding);
    assert_eq!(err.to_string(), "Non zero padding");
}

#[test]
fn test_base58_length_and_prefix_limits() {
    let params = Params::main();

    // 56 characters of valid alphabet: too long to even try.
    let long = "1".repeat(56);
    assert_eq!(
        Address::from_base58(&long, &params).unwrap_err(),
        AddressError::InvalidBase58Length
    );

    // A testnet address decodes but carries a foreign version byte.
    let testnet = Address::pubkey_hash([7; 20]).to_base58(&Params::testnet());
    assert_eq!(
        Address::from_base58(&testnet, &params).unwrap_err(),
        AddressError::UnknownPrefix
    );
}

#[test]
fn test_parse_prefers_cashaddr_for_single_case() {
    let params = Params::main();
    let address = Address::pubkey_hash([0x5a; 20]);

    // Uppercase cashaddr still parses (single case).
    let upper = address.to_cashaddr(&params).to_uppercase();
    assert_eq!(Address::parse(&upper, &params).unwrap(), address);

    // Garbage falls through both decoders.
    assert!(Address::parse("notanaddress", &params).is_err());
}

#[test]
fn test_round_trip_across_networks() {
    for params in [Params::main(), Params::testnet(), Params::regtest()] {
        for address in [
            Address::pubkey_hash([0x00; 20]),
            Address::pubkey_hash([0xff; 20]),
            Address::script_hash([0x3c; 20]),
        ] {
            let base58 = address.to_base58(&params);
            assert_eq!(Address::from_base58(&base58, &params).unwrap(), address);

            let cash = address.to_cashaddr(&params);
            assert!(cash.starts_with(params.address.cashaddr));
            assert_eq!(Address::from_cashaddr(&cash, &params).unwrap(), address);
        }
    }
}
