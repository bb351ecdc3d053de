use crate::contracts::HardcodedContract;

const JUNIT4: &str = "org/junit/Assert";
const JUPITER: &str = "org/junit/jupiter/api/Assertions";

const ENTRIES: &[HardcodedContract] = &[
    HardcodedContract::method(JUNIT4, "assertNotNull", "(Ljava/lang/Object;)V")
        .contract("null -> fail"),
    HardcodedContract::method(JUNIT4, "assertNotNull", "(Ljava/lang/String;Ljava/lang/Object;)V")
        .contract("_, null -> fail"),
    HardcodedContract::method(JUNIT4, "assertNull", "(Ljava/lang/Object;)V")
        .contract("!null -> fail"),
    HardcodedContract::method(JUNIT4, "assertTrue", "(Z)V").contract("false -> fail"),
    HardcodedContract::method(JUNIT4, "assertTrue", "(Ljava/lang/String;Z)V")
        .contract("_, false -> fail"),
    HardcodedContract::method(JUNIT4, "assertFalse", "(Z)V").contract("true -> fail"),
    HardcodedContract::method(JUNIT4, "assertFalse", "(Ljava/lang/String;Z)V")
        .contract("_, true -> fail"),
    HardcodedContract::method(JUNIT4, "fail", "()V").contract(" -> fail"),
    HardcodedContract::method(JUPITER, "assertNotNull", "(Ljava/lang/Object;)V")
        .contract("null -> fail"),
    HardcodedContract::method(JUPITER, "assertNotNull", "(Ljava/lang/Object;Ljava/lang/String;)V")
        .contract("null, _ -> fail"),
    HardcodedContract::method(JUPITER, "assertNull", "(Ljava/lang/Object;)V")
        .contract("!null -> fail"),
    HardcodedContract::method(JUPITER, "assertTrue", "(Z)V").contract("false -> fail"),
    HardcodedContract::method(JUPITER, "assertTrue", "(ZLjava/lang/String;)V")
        .contract("false, _ -> fail"),
    HardcodedContract::method(JUPITER, "assertFalse", "(Z)V").contract("true -> fail"),
    HardcodedContract::method(JUPITER, "assertFalse", "(ZLjava/lang/String;)V")
        .contract("true, _ -> fail"),
];

crate::register_contracts!("assertions", ENTRIES);
